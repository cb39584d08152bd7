//! Message identifiers of the control service.
//!
//! The control service (service type 0) manages client identifiers and
//! service enumeration on mux transports. QRTR transports never carry
//! control traffic; the router takes over those duties.

pub const SET_INSTANCE_ID: u16 = 0x0020;
pub const GET_VERSION_INFO: u16 = 0x0021;
pub const GET_CLIENT_ID: u16 = 0x0022;
pub const RELEASE_CLIENT_ID: u16 = 0x0023;
pub const REVOKE_CLIENT_ID: u16 = 0x0024;
pub const INVALID_CLIENT_ID: u16 = 0x0025;
pub const SET_DATA_FORMAT: u16 = 0x0026;
pub const SYNC: u16 = 0x0027;
pub const SET_EVENT: u16 = 0x0028;

/// Value size of the result-code TLV (type 0x02).
pub(crate) const RESULT_CODE_SIZE: usize = 4;
/// Value size of the client-id TLV in a GET_CLIENT_ID response.
pub(crate) const CLIENT_ID_SIZE: usize = 2;
/// Minimum value size of the service-list TLV in a GET_VERSION_INFO
/// response (the entry count; entries follow).
pub(crate) const SERVICE_LIST_SIZE: usize = 1;
/// Size of one service-list entry.
pub(crate) const SERVICE_ENTRY_SIZE: usize = 5;
