//! Silent Payments (BIP352) block scanner.
//!
//! Detects wallet-owned outputs by scanning per-block tweaks and compact
//! filters served by a semi-trusted indexing oracle, without revealing the
//! wallet's addresses to it. Fetching and processing run concurrently;
//! wallet state is finalized strictly in height order.

pub mod constants;

mod backend;
mod client;
mod controller;
mod error;
mod scanner;
mod updater;
mod wallet;

pub use bitcoin;
pub use silentpayments;

pub use backend::{BlockData, ChainBackend, FilterData, FilterKind, SpentIndexData, UtxoData};
pub use client::{OutputSpendStatus, OwnedUtxo, SpClient, SpendKey};
pub use controller::{ScanController, ScanStatus};
pub use error::StateError;
pub use scanner::{ScannerOptions, SpScanner};
pub use updater::{NoopUpdater, Updater};
pub use wallet::{UtxoStats, UtxoStore, WalletState};
