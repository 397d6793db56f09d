//! In-memory owned-UTXO set and scan cursor.
//!
//! This is the only mutable state the pipeline shares. It is guarded by a
//! single mutex and mutated exclusively by the ordered finish stage (plus the
//! rescan entry points, which are only valid while no scan runs).

use std::collections::HashMap;

use bitcoin::{Amount, OutPoint};
use log::info;
use serde::{Deserialize, Serialize};

use crate::client::{OutputSpendStatus, OwnedUtxo};

/// Aggregate view over the owned set, for consumers like a balance display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoStats {
    pub total: usize,
    pub unspent: usize,
    pub spent: usize,
    pub unspent_amount: Amount,
}

/// Deduplicated store of every output ever confirmed as owned.
///
/// Entries are keyed by outpoint, which makes the insert-if-absent check a
/// map lookup instead of a scan over the full history. Entries are never
/// removed individually; only a forced rescan clears the set.
#[derive(Debug, Default)]
pub struct UtxoStore {
    utxos: HashMap<OutPoint, OwnedUtxo>,
}

impl UtxoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_all_owned_utxos(&self) -> &HashMap<OutPoint, OwnedUtxo> {
        &self.utxos
    }

    /// Replace the set from persisted state at construction.
    pub fn load_existing_utxos(&mut self, utxos: HashMap<OutPoint, OwnedUtxo>) {
        self.utxos = utxos;
    }

    /// Reset to empty, for a new wallet or a forced rescan.
    pub fn clear_utxos(&mut self) {
        self.utxos.clear();
    }

    /// Insert outputs, skipping any outpoint already present. Returns how
    /// many entries were actually inserted, so callers can decide whether an
    /// update notification is warranted.
    pub fn add_utxos_safely(
        &mut self,
        new: impl IntoIterator<Item = (OutPoint, OwnedUtxo)>,
    ) -> usize {
        let mut inserted = 0;
        for (outpoint, utxo) in new {
            if let std::collections::hash_map::Entry::Vacant(entry) = self.utxos.entry(outpoint)
            {
                entry.insert(utxo);
                inserted += 1;
            }
        }
        inserted
    }

    /// Transition the given outpoints to `Spent`. Outpoints not in the set
    /// are ignored; entries already spent stay spent. Returns the number of
    /// entries that actually changed state.
    pub fn mark_spent(&mut self, spent: &[OutPoint]) -> usize {
        let mut changed = 0;
        for outpoint in spent {
            if let Some(utxo) = self.utxos.get_mut(outpoint) {
                if !utxo.spend_status.is_spent() {
                    utxo.mark_spent();
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Outpoints that could still be spent by a future block.
    pub fn unspent_outpoints(&self) -> Vec<OutPoint> {
        self.utxos
            .iter()
            .filter(|(_, utxo)| !utxo.spend_status.is_spent())
            .map(|(outpoint, _)| *outpoint)
            .collect()
    }

    pub fn get_utxo_stats(&self) -> UtxoStats {
        let mut stats = UtxoStats {
            total: self.utxos.len(),
            unspent: 0,
            spent: 0,
            unspent_amount: Amount::ZERO,
        };
        for utxo in self.utxos.values() {
            match utxo.spend_status {
                OutputSpendStatus::Spent => stats.spent += 1,
                _ => {
                    stats.unspent += 1;
                    stats.unspent_amount += utxo.amount;
                }
            }
        }
        stats
    }
}

/// Owned-UTXO set plus the scan cursor, behind one lock.
#[derive(Debug)]
pub struct WalletState {
    store: UtxoStore,
    birth_height: u32,
    last_scan: u32,
}

impl WalletState {
    pub fn new(birth_height: u32) -> Self {
        Self {
            store: UtxoStore::new(),
            birth_height,
            last_scan: 0,
        }
    }

    pub fn birth_height(&self) -> u32 {
        self.birth_height
    }

    pub fn last_scan(&self) -> u32 {
        self.last_scan
    }

    /// Restore the cursor from persisted state, or rewind it for a rescan.
    pub fn set_last_scan(&mut self, height: u32) {
        self.last_scan = height;
    }

    pub fn store(&self) -> &UtxoStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut UtxoStore {
        &mut self.store
    }

    /// First height the next sync cycle has to look at.
    pub fn next_scan_height(&self) -> u32 {
        self.birth_height.max(self.last_scan + 1)
    }

    /// Rewind the cursor so the next scan starts at `height`. When `clear` is
    /// set the owned set is dropped as well; re-found outputs dedup to a
    /// no-op otherwise.
    pub fn rewind_to(&mut self, height: u32, clear: bool) {
        if clear {
            self.store.clear_utxos();
            info!("cleared owned utxo set for forced rescan from {}", height);
        }
        self.last_scan = height.saturating_sub(1);
    }
}
