use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{absolute::Height, secp256k1::PublicKey, Amount};

use super::structs::{FilterData, FilterKind, SpentIndexData, UtxoData};

/// Oracle serving per-block tweaks, compact filters and output data.
///
/// The wire protocol is the implementor's concern; the scanner only assumes
/// that each call is independent and may be issued for many heights
/// concurrently.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Current chain tip known to the oracle.
    async fn block_height(&self) -> Result<Height>;

    /// Per-transaction tweaks for a block, restricted to transactions with at
    /// least one output above `dust_limit`.
    async fn tweaks(&self, block_height: Height, dust_limit: Amount) -> Result<Vec<PublicKey>>;

    /// Compact filter of the given kind for a block.
    async fn filter(&self, block_height: Height, kind: FilterKind) -> Result<FilterData>;

    /// Full output list for a block.
    async fn utxos(&self, block_height: Height) -> Result<Vec<UtxoData>>;

    /// Truncated hashes of the outpoints spent in a block.
    async fn spent_index(&self, block_height: Height) -> Result<SpentIndexData>;
}
