//! Tuning defaults for the scanning pipeline. All of these can be overridden
//! through [`ScannerOptions`](crate::ScannerOptions).

/// How many block fetches may be in flight against the oracle at once.
pub const DEFAULT_CONCURRENT_BLOCK_FETCHES: usize = 100;

/// Dust limit passed to the oracle when requesting tweaks, in satoshis.
pub const DEFAULT_DUST_LIMIT_SATS: u64 = 0;

/// Pause between two sync cycles while following the chain tip.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// How long `stop_sync` waits for the background loop before forcing Idle.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Capacity of the fetch -> process channel. A full channel blocks the fetch
/// pool, which is the backpressure mechanism for slow processing.
pub(crate) const BLOCK_CHANNEL_SIZE: usize = 32;

/// Capacity of the process -> finish channel.
pub(crate) const PROCESSED_CHANNEL_SIZE: usize = 32;
