//! Errors reported synchronously by the scan control state machine.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// `start` was called while a scan loop is already running.
    #[error("scanner is already running")]
    AlreadyScanning,
    /// A rescan was requested while a scan loop is running.
    #[error("cannot rewind scan height while a scan is in progress")]
    ScanInProgress,
}
