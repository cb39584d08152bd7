//! TLV parameter building and result decoding.
//!
//! Request payloads are runs of `{type: u8, length: u16 LE, value}`
//! entries built up through [`Param`]. Received payloads are read through
//! [`QmiResult`], a borrowed view that scans for typed entries on demand.

use log::debug;

use crate::error::Error;
use crate::wire::{TLV_HDR_SIZE, get_u16};

/// The result-code TLV carried by every response.
const RESULT_TLV: u8 = 0x02;

/// Scans a TLV area for an entry of the given type.
///
/// Entries whose advertised length runs past the end of the buffer
/// terminate the scan; nothing beyond the buffer is ever touched.
pub(crate) fn tlv_get(data: &[u8], tlv_type: u8) -> Option<&[u8]> {
	let mut offset = 0;

	while data.len() - offset > TLV_HDR_SIZE {
		let length = usize::from(get_u16(data, offset + 1));
		let value = offset + TLV_HDR_SIZE;

		if value + length > data.len() {
			break;
		}

		if data[offset] == tlv_type {
			return Some(&data[value..value + length]);
		}

		offset = value + length;
	}

	None
}

/// An outbound TLV payload under construction.
#[derive(Debug, Default)]
pub struct Param {
	data: Vec<u8>,
}

impl Param {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a raw TLV. Type 0 is reserved and rejected; an empty value
	/// is accepted and appends nothing.
	pub fn append(&mut self, tlv_type: u8, value: &[u8]) -> Result<(), Error> {
		if tlv_type == 0 {
			return Err(Error::InvalidParameter);
		}

		if value.is_empty() {
			return Ok(());
		}

		let length = u16::try_from(value.len()).map_err(|_| Error::InvalidParameter)?;

		self.data.push(tlv_type);
		self.data.extend_from_slice(&length.to_le_bytes());
		self.data.extend_from_slice(value);

		Ok(())
	}

	pub fn append_u8(&mut self, tlv_type: u8, value: u8) -> Result<(), Error> {
		self.append(tlv_type, &[value])
	}

	pub fn append_u16(&mut self, tlv_type: u8, value: u16) -> Result<(), Error> {
		self.append(tlv_type, &value.to_le_bytes())
	}

	pub fn append_u32(&mut self, tlv_type: u8, value: u32) -> Result<(), Error> {
		self.append(tlv_type, &value.to_le_bytes())
	}

	pub fn new_u8(tlv_type: u8, value: u8) -> Result<Self, Error> {
		let mut param = Self::new();
		param.append_u8(tlv_type, value)?;
		Ok(param)
	}

	pub fn new_u16(tlv_type: u8, value: u16) -> Result<Self, Error> {
		let mut param = Self::new();
		param.append_u16(tlv_type, value)?;
		Ok(param)
	}

	pub fn new_u32(tlv_type: u8, value: u32) -> Result<Self, Error> {
		let mut param = Self::new();
		param.append_u32(tlv_type, value)?;
		Ok(param)
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub(crate) fn data(&self) -> &[u8] {
		&self.data
	}
}

/// A borrowed view of a received payload.
///
/// For responses the result-code TLV is pre-parsed; indications carry an
/// implicit success. The view only lives for the duration of the
/// completion or notification callback it is handed to.
#[derive(Debug, Clone, Copy)]
pub struct QmiResult<'a> {
	message: u16,
	result: u16,
	error: u16,
	data: &'a [u8],
}

impl<'a> QmiResult<'a> {
	pub(crate) fn response(message: u16, data: &'a [u8]) -> Self {
		let mut result = 0;
		let mut error = 0;

		if let Some(code) = tlv_get(data, RESULT_TLV)
			&& code.len() == crate::ctl::RESULT_CODE_SIZE
		{
			result = get_u16(code, 0);
			error = get_u16(code, 2);
		}

		Self {
			message,
			result,
			error,
			data,
		}
	}

	pub(crate) fn indication(message: u16, data: &'a [u8]) -> Self {
		Self {
			message,
			result: 0,
			error: 0,
			data,
		}
	}

	/// The message identifier this payload belongs to.
	pub fn message(&self) -> u16 {
		self.message
	}

	/// The QMI error number, or `None` if the call succeeded.
	pub fn error(&self) -> Option<u16> {
		if self.result == 0x0000 {
			None
		} else {
			Some(self.error)
		}
	}

	/// The canonical name of the carried error, if any.
	pub fn error_name(&self) -> Option<&'static str> {
		self.error().and_then(crate::error::error_to_string)
	}

	/// Returns the raw value of the TLV of the given type.
	pub fn get(&self, tlv_type: u8) -> Option<&'a [u8]> {
		if tlv_type == 0 {
			return None;
		}

		tlv_get(self.data, tlv_type)
	}

	pub fn get_u8(&self, tlv_type: u8) -> Option<u8> {
		self.get(tlv_type).filter(|v| !v.is_empty()).map(|v| v[0])
	}

	pub fn get_i16(&self, tlv_type: u8) -> Option<i16> {
		self.get(tlv_type)
			.filter(|v| v.len() >= 2)
			.map(|v| i16::from_le_bytes([v[0], v[1]]))
	}

	pub fn get_u16(&self, tlv_type: u8) -> Option<u16> {
		self.get(tlv_type)
			.filter(|v| v.len() >= 2)
			.map(|v| get_u16(v, 0))
	}

	pub fn get_u32(&self, tlv_type: u8) -> Option<u32> {
		self.get(tlv_type)
			.filter(|v| v.len() >= 4)
			.map(|v| crate::wire::get_u32(v, 0))
	}

	pub fn get_u64(&self, tlv_type: u8) -> Option<u64> {
		self.get(tlv_type)
			.filter(|v| v.len() >= 8)
			.map(|v| u64::from_le_bytes(v[..8].try_into().unwrap()))
	}

	/// Copies out a string value. The length comes from the TLV header;
	/// no NUL terminator is assumed.
	pub fn get_string(&self, tlv_type: u8) -> Option<String> {
		self.get(tlv_type)
			.map(|v| String::from_utf8_lossy(v).into_owned())
	}

	/// Logs every TLV in the payload, for protocol debugging.
	pub fn print_tlvs(&self) {
		let mut offset = 0;

		while self.data.len() - offset > TLV_HDR_SIZE {
			let length = usize::from(get_u16(self.data, offset + 1));

			debug!("tlv: 0x{:02x} len 0x{:04x}", self.data[offset], length);

			offset += TLV_HDR_SIZE + length;
			if offset > self.data.len() {
				break;
			}
		}
	}
}
