use bitcoin::{absolute::Height, secp256k1::PublicKey, Amount, BlockHash, ScriptBuf, Txid};

/// The two per-block compact filters served by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Filter over the taproot output keys created in the block.
    NewOutputs,
    /// Filter over the truncated hashes of outpoints spent in the block.
    SpentOutpoints,
}

/// Raw GCS filter bytes for one block, together with the hash of that block
/// (which doubles as the filter key).
#[derive(Debug, Clone)]
pub struct FilterData {
    pub block_hash: BlockHash,
    pub data: Vec<u8>,
}

/// An output as reported by the oracle, before any ownership check.
#[derive(Debug, Clone)]
pub struct UtxoData {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
    pub scriptpubkey: ScriptBuf,
    pub block_height: Height,
    pub block_hash: BlockHash,
    pub timestamp: u64,
    pub spent: bool,
}

/// 8-byte truncated hashes of every outpoint spent in one block.
#[derive(Debug, Clone)]
pub struct SpentIndexData {
    pub data: Vec<Vec<u8>>,
}

/// Everything fetched up front for one block: enough to decide whether the
/// block is relevant, but not the utxos or the spent index. Those are only
/// fetched once a filter matches.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub blkheight: Height,
    pub blkhash: BlockHash,
    pub tweaks: Vec<PublicKey>,
    pub new_utxo_filter: FilterData,
    pub spent_filter: FilterData,
}
