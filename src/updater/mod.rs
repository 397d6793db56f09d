use bitcoin::absolute::Height;

/// Observer for scan events, shared across the pipeline tasks.
///
/// Implementations forward these to a GUI or manager layer. Both callbacks
/// fire from the single-threaded finish stage: `send_scan_progress` fires
/// exactly once per finished height, in strictly increasing order, and
/// `send_utxo_update` only fires when at least one new output was actually
/// inserted into the owned set.
pub trait Updater: Send + Sync {
    fn send_scan_progress(&self, current: Height);

    fn send_utxo_update(&self, inserted: usize);
}

/// Updater that drops every event, for headless use and tests.
#[derive(Debug, Default)]
pub struct NoopUpdater;

impl Updater for NoopUpdater {
    fn send_scan_progress(&self, _current: Height) {}

    fn send_utxo_update(&self, _inserted: usize) {}
}
