//! QMI service-type identifiers.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Service type of the control service.
pub const SERVICE_CONTROL: u8 = 0x00;

/// The service types a modem may expose.
///
/// The wire carries service types as plain `u8`; unknown values flow
/// through the stack untouched, so this enum is only consulted where a
/// human-readable name is wanted or a caller prefers symbolic constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ServiceType {
	/// Control service
	Control = 0,
	/// Wireless data service
	Wds = 1,
	/// Device management service
	Dms = 2,
	/// Network access service
	Nas = 3,
	/// Quality of service, error service
	Qos = 4,
	/// Wireless messaging service
	Wms = 5,
	/// Position determination service
	Pds = 6,
	/// Authentication service
	Auth = 7,
	/// AT command processor service
	At = 8,
	/// Voice service
	Voice = 9,
	/// Card application toolkit service
	Cat = 10,
	/// UIM service
	Uim = 11,
	/// Phonebook service
	Pbm = 12,
	Qchat = 13,
	/// Remote file system service
	Rmtfs = 14,
	Test = 15,
	/// Location service
	Loc = 16,
	/// Specific absorption rate service
	Sar = 17,
	/// Core sound driver service
	Csd = 20,
	/// Embedded file system service
	Efs = 21,
	/// Thermal sensors service
	Ts = 23,
	/// Thermal mitigation device service
	Tmd = 24,
	/// Wireless data administrative service
	Wda = 26,
	Csvt = 29,
	Coex = 34,
	/// Persistent device configuration service
	Pdc = 36,
	Rfrpe = 41,
	Dsd = 42,
	Ssctl = 43,
	/// Data port mapper
	Dpm = 47,
	/// Card application toolkit service (legacy identifier)
	CatOld = 224,
	/// Remote management service
	Rms = 225,
	/// OMA device management service
	Oma = 226,
}

impl ServiceType {
	pub fn name(self) -> &'static str {
		match self {
			ServiceType::Control => "CTL",
			ServiceType::Wds => "WDS",
			ServiceType::Dms => "DMS",
			ServiceType::Nas => "NAS",
			ServiceType::Qos => "QOS",
			ServiceType::Wms => "WMS",
			ServiceType::Pds => "PDS",
			ServiceType::Auth => "AUTH",
			ServiceType::At => "AT",
			ServiceType::Voice => "VOICE",
			ServiceType::Cat | ServiceType::CatOld => "CAT",
			ServiceType::Uim => "UIM",
			ServiceType::Pbm => "PBM",
			ServiceType::Qchat => "QCHAT",
			ServiceType::Rmtfs => "RMTFS",
			ServiceType::Test => "TEST",
			ServiceType::Loc => "LOC",
			ServiceType::Sar => "SAR",
			ServiceType::Csd => "CSD",
			ServiceType::Efs => "EFS",
			ServiceType::Ts => "TS",
			ServiceType::Tmd => "TMD",
			ServiceType::Wda => "WDA",
			ServiceType::Csvt => "CSVT",
			ServiceType::Coex => "COEX",
			ServiceType::Pdc => "PDC",
			ServiceType::Rfrpe => "RFRPE",
			ServiceType::Dsd => "DSD",
			ServiceType::Ssctl => "SSCTL",
			ServiceType::Dpm => "DPM",
			ServiceType::Rms => "RMS",
			ServiceType::Oma => "OMA",
		}
	}
}

/// Returns the display name of a service type, if it is a known one.
pub fn service_type_name(service: u8) -> Option<&'static str> {
	ServiceType::try_from(service).ok().map(ServiceType::name)
}
