//! Wire tracing through the host-provided debug sink.
//!
//! The sink receives complete lines: hexdumps prefixed with a direction
//! marker and a decoded one-liner per message. It must not call back into
//! the device.

use std::fmt;

use crate::ctl::RESULT_CODE_SIZE;
use crate::error::error_to_string;
use crate::services::{SERVICE_CONTROL, service_type_name};
use crate::wire::{
	ControlKind, MESSAGE_HDR_SIZE, MUX_HDR_SIZE, ServiceKind, TLV_HDR_SIZE, get_u16, headroom,
};

pub(crate) type DebugSink = Box<dyn FnMut(&str)>;

pub(crate) fn debug_line(sink: &mut Option<DebugSink>, args: fmt::Arguments<'_>) {
	if let Some(func) = sink.as_mut() {
		func(&args.to_string());
	}
}

/// Dumps a buffer in 16-byte lines with a printable column. The first
/// line carries the direction marker, continuation lines a blank.
pub(crate) fn hexdump(dir: char, buf: &[u8], sink: &mut Option<DebugSink>) {
	let Some(func) = sink.as_mut() else {
		return;
	};

	if buf.is_empty() {
		return;
	}

	let mut marker = dir;

	for chunk in buf.chunks(16) {
		let mut line = String::with_capacity(67);

		line.push(marker);
		for byte in chunk {
			line.push_str(&format!(" {byte:02x}"));
		}
		for _ in chunk.len()..16 {
			line.push_str("   ");
		}
		line.push_str("  ");
		for &byte in chunk {
			line.push(if byte.is_ascii_graphic() || byte == b' ' {
				byte as char
			} else {
				'.'
			});
		}

		func(&line);
		marker = ' ';
	}
}

/// Emits the decoded one-liner for a complete frame, followed by TLV
/// annotations. The result-code TLV is rendered with the error name.
pub(crate) fn trace_message(dir: char, buf: &[u8], sink: &mut Option<DebugSink>) {
	if sink.is_none() {
		return;
	}

	if buf.len() < MUX_HDR_SIZE {
		return;
	}

	let service = buf[4];
	let client = buf[5];
	let headroom = headroom(service);

	if buf.len() < MUX_HDR_SIZE + headroom + MESSAGE_HDR_SIZE {
		return;
	}

	let kind = buf[MUX_HDR_SIZE];
	let (suffix, tid) = if service == SERVICE_CONTROL {
		let suffix = match ControlKind::try_from(kind) {
			Ok(ControlKind::Request) => "_req",
			Ok(ControlKind::Response) => "_resp",
			Ok(ControlKind::Indication) => "_ind",
			Err(_) => "",
		};
		(suffix, u16::from(buf[MUX_HDR_SIZE + 1]))
	} else {
		let suffix = match ServiceKind::try_from(kind) {
			Ok(ServiceKind::Request) => "_req",
			Ok(ServiceKind::Response) => "_resp",
			Ok(ServiceKind::Indication) => "_ind",
			Err(_) => "",
		};
		(suffix, get_u16(buf, MUX_HDR_SIZE + 1))
	};

	let msg = MUX_HDR_SIZE + headroom;
	let message = get_u16(buf, msg);
	let msg_len = get_u16(buf, msg + 2);

	let mut line = match service_type_name(service) {
		Some(name) => format!("{dir}   {name}"),
		None => format!("{dir}   {service}"),
	};

	line.push_str(&format!("{suffix} msg={message} len={msg_len}"));
	line.push_str(&format!(
		" [client={client},type={kind},tid={tid},len={}]",
		get_u16(buf, 1)
	));

	debug_line(sink, format_args!("{line}"));

	let data = &buf[msg + MESSAGE_HDR_SIZE..];
	let total = usize::from(msg_len).min(data.len());
	if total == 0 {
		return;
	}

	let mut line = String::from("      ");
	let mut pending = false;
	let mut offset = 0;

	while offset + TLV_HDR_SIZE < total {
		let tlv_type = data[offset];
		let tlv_length = usize::from(get_u16(data, offset + 1));
		let value = offset + TLV_HDR_SIZE;

		if tlv_type == 0x02
			&& tlv_length == RESULT_CODE_SIZE
			&& value + RESULT_CODE_SIZE <= data.len()
		{
			let error = get_u16(data, value + 2);
			match error_to_string(error) {
				Some(name) => line.push_str(&format!(" {{type={tlv_type},error={name}}}")),
				None => line.push_str(&format!(" {{type={tlv_type},error={error}}}")),
			}
		} else {
			line.push_str(&format!(" {{type={tlv_type},len={tlv_length}}}"));
		}

		if line.len() > 60 {
			debug_line(sink, format_args!("{line}"));
			line = String::from("      ");
			pending = false;
		} else {
			pending = true;
		}

		offset = value + tlv_length;
	}

	if pending {
		debug_line(sink, format_args!("{line}"));
	}
}
