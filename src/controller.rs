//! Idle/Scanning state machine wrapping the scanner for continuous
//! background operation.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use bitcoin::OutPoint;
use log::{info, warn};
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, timeout};

use crate::{
    client::OwnedUtxo,
    error::StateError,
    scanner::SpScanner,
    wallet::{UtxoStats, WalletState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Idle,
    Scanning,
}

/// Drives the scanner in a background task: sync to tip, sleep a fixed
/// interval, repeat. Cancellation is cooperative; an in-flight oracle call is
/// never interrupted, only future work is skipped.
pub struct ScanController {
    scanner: Arc<SpScanner>,
    wallet: Arc<Mutex<WalletState>>,
    interrupt: Arc<AtomicBool>,
    scanning: Arc<AtomicBool>,
    /// Wakes the current run's interval sleep. Replaced on every `start` so a
    /// permit stored by a stop request from an earlier run (or from Idle)
    /// cannot wake the new loop.
    stop_notify: Mutex<Arc<Notify>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScanController {
    pub fn new(scanner: SpScanner) -> Self {
        let interrupt = scanner.interrupt_handle();
        let wallet = scanner.wallet_handle();
        Self {
            scanner: Arc::new(scanner),
            wallet,
            interrupt,
            scanning: Arc::new(AtomicBool::new(false)),
            stop_notify: Mutex::new(Arc::new(Notify::new())),
            done_rx: Mutex::new(None),
        }
    }

    /// Direct access to the wrapped scanner, for foreground one-shot syncs.
    pub fn scanner(&self) -> &SpScanner {
        &self.scanner
    }

    pub fn status(&self) -> ScanStatus {
        if self.is_scanning() {
            ScanStatus::Scanning
        } else {
            ScanStatus::Idle
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Idle -> Scanning. Launches the background loop; must be called from
    /// within a tokio runtime.
    ///
    /// A failed sync cycle is logged and retried on the next cycle after the
    /// poll interval, there is no backoff.
    pub fn start(&self) -> Result<(), StateError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StateError::AlreadyScanning);
        }
        self.interrupt.store(false, Ordering::Release);

        let (done_tx, done_rx) = oneshot::channel();
        *self.done_rx.lock().unwrap() = Some(done_rx);

        let stop_notify = Arc::new(Notify::new());
        *self.stop_notify.lock().unwrap() = Arc::clone(&stop_notify);

        let scanner = Arc::clone(&self.scanner);
        let interrupt = Arc::clone(&self.interrupt);
        let scanning = Arc::clone(&self.scanning);
        let poll_interval = self.scanner.options().poll_interval;

        tokio::spawn(async move {
            info!("scan loop started");
            loop {
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = scanner.sync_to_tip().await {
                    warn!("sync cycle failed, retrying next cycle: {:#}", e);
                }
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }
                tokio::select! {
                    _ = stop_notify.notified() => break,
                    _ = sleep(poll_interval) => {}
                }
            }
            // Scanning -> Idle happens here, in the loop's own cleanup
            scanning.store(false, Ordering::Release);
            info!("scan loop stopped");
            let _ = done_tx.send(());
        });

        Ok(())
    }

    /// Request cancellation and return immediately. Safe to call repeatedly
    /// and from any state.
    pub fn stop(&self) {
        self.interrupt.store(true, Ordering::Release);
        self.stop_notify.lock().unwrap().notify_one();
    }

    /// Like `stop`, but waits for the background loop to confirm shutdown.
    /// After the configured timeout the state is forced to Idle and a warning
    /// is logged; the timeout is a safety net, not proof the loop exited.
    pub async fn stop_sync(&self) {
        self.stop();
        let done_rx = self.done_rx.lock().unwrap().take();
        let Some(done_rx) = done_rx else {
            return;
        };
        let stop_timeout = self.scanner.options().stop_timeout;
        match timeout(stop_timeout, done_rx).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "scan loop did not confirm shutdown within {:?}, forcing idle",
                    stop_timeout
                );
                self.scanning.store(false, Ordering::Release);
            }
        }
    }

    /// Rewind the cursor so the next scan starts at `height`. Only valid
    /// while Idle. Already-known outputs found again after the rewind dedup
    /// to a no-op.
    pub fn rescan_from_height(&self, height: u32) -> Result<(), StateError> {
        self.rewind(height, false)
    }

    /// Like `rescan_from_height`, but drops the owned-UTXO set first so the
    /// wallet is rebuilt from scratch.
    pub fn force_rescan_from_height(&self, height: u32) -> Result<(), StateError> {
        self.rewind(height, true)
    }

    fn rewind(&self, height: u32, clear: bool) -> Result<(), StateError> {
        if self.is_scanning() {
            return Err(StateError::ScanInProgress);
        }
        self.wallet.lock().unwrap().rewind_to(height, clear);
        Ok(())
    }

    pub fn get_all_owned_utxos(&self) -> HashMap<OutPoint, OwnedUtxo> {
        self.wallet
            .lock()
            .unwrap()
            .store()
            .get_all_owned_utxos()
            .clone()
    }

    pub fn get_utxo_stats(&self) -> UtxoStats {
        self.wallet.lock().unwrap().store().get_utxo_stats()
    }

    pub fn last_scan_height(&self) -> u32 {
        self.wallet.lock().unwrap().last_scan()
    }
}
