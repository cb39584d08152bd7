use std::time::Duration;

/// Size of the per-read scratch buffer of both transports. Frames never
/// span two reads; whatever does not fit is discarded by the framer.
pub(crate) const RECV_BUF_SIZE: usize = 2048;

/// How long service discovery waits for the modem before the user
/// callback fires with whatever has been collected.
pub(crate) const DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long client-id allocation may take before the create callback
/// fires empty-handed.
pub(crate) const SERVICE_CREATE_TIMEOUT: Duration = Duration::from_secs(8);
