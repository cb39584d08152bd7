//! The kernel's expected-data-format toggle.
//!
//! The `qmi_wwan` driver exposes a per-interface `raw_ip` attribute. The
//! interface belonging to a control descriptor is found by resolving the
//! descriptor through procfs and walking the device's sysfs entry.

use std::fs;
use std::os::fd::RawFd;

use log::debug;

use crate::error::Error;

/// Link-layer framing of the paired network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
	/// 802.3 ethernet framing.
	Ieee8023,
	/// Raw IP packets.
	RawIp,
}

fn device_file_name(fd: RawFd) -> Option<String> {
	let path = fs::read_link(format!("/proc/self/fd/{fd}")).ok()?;
	path.file_name()
		.map(|name| name.to_string_lossy().into_owned())
}

fn device_interface(fd: RawFd) -> Option<String> {
	let name = device_file_name(fd)?;

	for driver in ["usbmisc", "usb"] {
		let Ok(entries) = fs::read_dir(format!("/sys/class/{driver}/{name}/device/net")) else {
			continue;
		};

		for entry in entries.flatten() {
			if entry.file_type().is_ok_and(|file_type| file_type.is_dir()) {
				return Some(entry.file_name().to_string_lossy().into_owned());
			}
		}
	}

	None
}

fn raw_ip_path(fd: RawFd) -> Option<String> {
	let interface = device_interface(fd)?;
	Some(format!("/sys/class/net/{interface}/qmi/raw_ip"))
}

pub(crate) fn expected_data_format(fd: RawFd) -> Option<DataFormat> {
	let path = raw_ip_path(fd)?;

	let contents = match fs::read(&path) {
		Ok(contents) => contents,
		Err(err) => {
			// Not necessarily supported by the kernel.
			debug!("cannot read {path}: {err}");
			return None;
		}
	};

	match contents.first() {
		Some(b'Y') => Some(DataFormat::RawIp),
		Some(b'N') => Some(DataFormat::Ieee8023),
		_ => {
			debug!("unexpected contents in {path}");
			None
		}
	}
}

pub(crate) fn set_expected_data_format(fd: RawFd, format: DataFormat) -> Result<(), Error> {
	let value = match format {
		DataFormat::Ieee8023 => "N",
		DataFormat::RawIp => "Y",
	};

	let path = raw_ip_path(fd).ok_or(Error::NotSupported)?;
	fs::write(&path, value)?;

	Ok(())
}
