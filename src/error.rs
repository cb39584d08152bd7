//! Error types and the QMI error-code taxonomy.

use thiserror::Error;

/// Errors surfaced by the device and service APIs.
///
/// These cover local failures only. A request that reaches the modem and
/// is answered with a non-zero result code is *not* an [`Error`]; the
/// QMI error number travels in the [`QmiResult`](crate::tlv::QmiResult)
/// handed to the completion callback.
#[derive(Debug, Error)]
pub enum Error {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("invalid parameter")]
	InvalidParameter,
	#[error("service type cannot be used here")]
	InvalidService,
	#[error("no service versions discovered yet")]
	NoVersionInfo,
	#[error("service not present on this modem")]
	ServiceUnknown,
	#[error("operation not supported on this transport")]
	NotSupported,
	#[error("operation already in progress")]
	InProgress,
	#[error("device has been torn down")]
	Detached,
}

/// Returns the canonical name of a QMI error code.
pub fn error_to_string(error: u16) -> Option<&'static str> {
	let str = match error {
		0x0000 => "NONE",
		0x0001 => "MALFORMED_MSG",
		0x0002 => "NO_MEMORY",
		0x0003 => "INTERNAL",
		0x0004 => "ABORTED",
		0x0005 => "CLIENT_IDS_EXHAUSTED",
		0x0006 => "UNABORTABLE_TRANSACTION",
		0x0007 => "INVALID_CLIENT_ID",
		0x0008 => "NO_THRESHOLDS",
		0x0009 => "INVALID_HANDLE",
		0x000a => "INVALID_PROFILE",
		0x000b => "INVALID_PINID",
		0x000c => "INCORRECT_PIN",
		0x000d => "NO_NETWORK_FOUND",
		0x000e => "CALL_FAILED",
		0x000f => "OUT_OF_CALL",
		0x0010 => "NOT_PROVISIONED",
		0x0011 => "MISSING_ARG",
		0x0013 => "ARG_TOO_LONG",
		0x0016 => "INVALID_TX_ID",
		0x0017 => "DEVICE_IN_USE",
		0x0018 => "OP_NETWORK_UNSUPPORTED",
		0x0019 => "OP_DEVICE_UNSUPPORTED",
		0x001a => "NO_EFFECT",
		0x001b => "NO_FREE_PROFILE",
		0x001c => "INVALID_PDP_TYPE",
		0x001d => "INVALID_TECH_PREF",
		0x001e => "INVALID_PROFILE_TYPE",
		0x001f => "INVALID_SERVICE_TYPE",
		0x0020 => "INVALID_REGISTER_ACTION",
		0x0021 => "INVALID_PS_ATTACH_ACTION",
		0x0022 => "AUTHENTICATION_FAILED",
		0x0023 => "PIN_BLOCKED",
		0x0024 => "PIN_PERM_BLOCKED",
		0x0025 => "UIM_NOT_INITIALIZED",
		0x0026 => "MAX_QOS_REQUESTS_IN_USE",
		0x0027 => "INCORRECT_FLOW_FILTER",
		0x0028 => "NETWORK_QOS_UNAWARE",
		0x0029 => "INVALID_QOS_ID/INVALID_ID",
		0x002a => "REQUESTED_NUM_UNSUPPORTED",
		0x002b => "INTERFACE_NOT_FOUND",
		0x002c => "FLOW_SUSPENDED",
		0x002d => "INVALID_DATA_FORMAT",
		0x002e => "GENERAL",
		0x002f => "UNKNOWN",
		0x0030 => "INVALID_ARG",
		0x0031 => "INVALID_INDEX",
		0x0032 => "NO_ENTRY",
		0x0033 => "DEVICE_STORAGE_FULL",
		0x0034 => "DEVICE_NOT_READY",
		0x0035 => "NETWORK_NOT_READY",
		0x0036 => "CAUSE_CODE",
		0x0037 => "MESSAGE_NOT_SENT",
		0x0038 => "MESSAGE_DELIVERY_FAILURE",
		0x0039 => "INVALID_MESSAGE_ID",
		0x003a => "ENCODING",
		0x003b => "AUTHENTICATION_LOCK",
		0x003c => "INVALID_TRANSACTION",
		0x0041 => "SESSION_INACTIVE",
		0x0042 => "SESSION_INVALID",
		0x0043 => "SESSION_OWNERSHIP",
		0x0044 => "INSUFFICIENT_RESOURCES",
		0x0045 => "DISABLED",
		0x0046 => "INVALID_OPERATION",
		0x0047 => "INVALID_QMI_CMD",
		0x0048 => "TPDU_TYPE",
		0x0049 => "SMSC_ADDR",
		0x004a => "INFO_UNAVAILABLE",
		0x004b => "SEGMENT_TOO_LONG",
		0x004c => "SEGEMENT_ORDER",
		0x004d => "BUNDLING_NOT_SUPPORTED",
		0x004f => "POLICY_MISMATCH",
		0x0050 => "SIM_FILE_NOT_FOUND",
		0x0051 => "EXTENDED_INTERNAL",
		0x0052 => "ACCESS_DENIED",
		0x0053 => "HARDWARE_RESTRICTED",
		0x0054 => "ACK_NOT_SENT",
		0x0055 => "INJECT_TIMEOUT",
		_ => return None,
	};

	Some(str)
}

/// Translates the QMI errors upper layers care about into CME error codes.
pub fn error_to_cme(error: u16) -> Option<u8> {
	match error {
		0x0019 => Some(4),  // Not Supported
		0x0052 => Some(32), // Access Denied
		_ => None,
	}
}
