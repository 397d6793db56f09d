//! In-memory oracle fake and recording updater shared by the integration
//! tests. The fake counts every call per endpoint so tests can assert which
//! oracle round-trips a scan did (or did not) issue.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bitcoin::{
    absolute::Height,
    bip158::GcsFilterWriter,
    hashes::{sha256, Hash, HashEngine},
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    Amount, BlockHash, Network, OutPoint, ScriptBuf, Txid,
};

use sp_scanner::{
    ChainBackend, FilterData, FilterKind, SpClient, SpendKey, SpentIndexData, Updater, UtxoData,
};

pub fn block_hash(height: u32) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    bytes[4] = 0xab;
    BlockHash::from_byte_array(bytes)
}

pub fn test_txid() -> Txid {
    Txid::from_str("5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456").unwrap()
}

pub fn test_client() -> SpClient {
    let scan_sk = SecretKey::from_slice(&[1u8; 32]).unwrap();
    let spend_sk = SecretKey::from_slice(&[2u8; 32]).unwrap();
    SpClient::new(scan_sk, SpendKey::Secret(spend_sk), &[], Network::Regtest).unwrap()
}

pub fn tweak_pubkey(byte: u8) -> PublicKey {
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    PublicKey::from_secret_key(&Secp256k1::new(), &sk)
}

/// One of the wallet's candidate scripts for this tweak; serving an output
/// with this script makes the exact scan confirm ownership.
pub fn candidate_spk(client: &SpClient, tweak: &PublicKey) -> Vec<u8> {
    let map = client.get_script_to_secret_map(std::slice::from_ref(tweak));
    let mut spks: Vec<[u8; 34]> = map.keys().copied().collect();
    assert!(!spks.is_empty(), "candidate derivation produced no scripts");
    spks.sort();
    spks[0].to_vec()
}

/// Truncated outpoint hash as served by the oracle's spent index.
pub fn spent_hash(outpoint: &OutPoint, blkhash: &BlockHash) -> Vec<u8> {
    let mut engine = sha256::HashEngine::default();
    engine.input(&outpoint.txid.to_byte_array());
    engine.input(&outpoint.vout.to_le_bytes());
    engine.input(&blkhash.to_byte_array());
    sha256::Hash::from_engine(engine).to_byte_array()[..8].to_vec()
}

/// BIP158 GCS filter over raw elements, keyed by the block hash.
pub fn build_filter(blkhash: &BlockHash, elements: &[Vec<u8>]) -> Vec<u8> {
    let hash = blkhash.to_byte_array();
    let k0 = u64::from_le_bytes(hash[0..8].try_into().unwrap());
    let k1 = u64::from_le_bytes(hash[8..16].try_into().unwrap());
    let mut out = Vec::new();
    let mut writer = GcsFilterWriter::new(&mut out, k0, k1, 784931, 19);
    for element in elements {
        writer.add_element(element);
    }
    writer.finish().unwrap();
    out
}

#[derive(Default, Clone)]
pub struct FakeBlock {
    pub tweaks: Vec<PublicKey>,
    pub new_filter_elements: Vec<Vec<u8>>,
    pub spent_filter_elements: Vec<Vec<u8>>,
    pub utxos: Vec<UtxoData>,
    pub spent_index: Vec<Vec<u8>>,
}

#[derive(Default)]
pub struct CallCounters {
    pub tweaks: AtomicUsize,
    pub filters: AtomicUsize,
    pub utxos: AtomicUsize,
    pub spent_index: AtomicUsize,
}

/// Call-counting in-memory oracle. Heights without an explicit block are
/// served as empty blocks with properly encoded empty filters.
#[derive(Default)]
pub struct FakeOracle {
    pub tip: AtomicU32,
    pub blocks: HashMap<u32, FakeBlock>,
    /// Artificial latency per height, in milliseconds, to force out-of-order
    /// fetch completion.
    pub delays: HashMap<u32, u64>,
    /// Fail every filter request for this height.
    pub fail_filter_at: Option<u32>,
    /// Serve undecodable filter bytes for this height, both kinds.
    pub garbage_filter_at: Option<u32>,
    pub calls: CallCounters,
}

impl FakeOracle {
    pub fn new(tip: u32) -> Self {
        Self {
            tip: AtomicU32::new(tip),
            ..Default::default()
        }
    }

    pub fn set_tip(&self, tip: u32) {
        self.tip.store(tip, Ordering::Relaxed);
    }

    /// Make `height` contain one freshly paid output for `client`, derived
    /// from `tweak`. Returns the outpoint of the served utxo.
    pub fn add_owned_output(
        &mut self,
        client: &SpClient,
        height: u32,
        tweak: PublicKey,
        value: Amount,
    ) -> OutPoint {
        let spk = candidate_spk(client, &tweak);
        let outpoint = OutPoint::new(test_txid(), 0);
        let block = self.blocks.entry(height).or_default();
        block.tweaks.push(tweak);
        block.new_filter_elements.push(spk[2..].to_vec());
        block.utxos.push(UtxoData {
            txid: outpoint.txid,
            vout: outpoint.vout,
            value,
            scriptpubkey: ScriptBuf::from_bytes(spk),
            block_height: Height::from_consensus(height).unwrap(),
            block_hash: block_hash(height),
            timestamp: 1_700_000_000,
            spent: false,
        });
        outpoint
    }

    /// Make `height` spend `outpoint` according to both the spent filter and
    /// the spent index.
    pub fn add_spend(&mut self, height: u32, outpoint: &OutPoint) {
        let hash = spent_hash(outpoint, &block_hash(height));
        let block = self.blocks.entry(height).or_default();
        block.spent_filter_elements.push(hash.clone());
        block.spent_index.push(hash);
    }

    fn block(&self, height: Height) -> FakeBlock {
        self.blocks
            .get(&height.to_consensus_u32())
            .cloned()
            .unwrap_or_default()
    }

    async fn maybe_delay(&self, height: Height) {
        if let Some(ms) = self.delays.get(&height.to_consensus_u32()) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
    }
}

#[async_trait]
impl ChainBackend for FakeOracle {
    async fn block_height(&self) -> Result<Height> {
        Ok(Height::from_consensus(self.tip.load(Ordering::Relaxed))?)
    }

    async fn tweaks(&self, block_height: Height, _dust_limit: Amount) -> Result<Vec<PublicKey>> {
        self.calls.tweaks.fetch_add(1, Ordering::Relaxed);
        self.maybe_delay(block_height).await;
        Ok(self.block(block_height).tweaks)
    }

    async fn filter(&self, block_height: Height, kind: FilterKind) -> Result<FilterData> {
        self.calls.filters.fetch_add(1, Ordering::Relaxed);
        self.maybe_delay(block_height).await;
        let height = block_height.to_consensus_u32();
        if self.fail_filter_at == Some(height) {
            return Err(anyhow!("oracle unreachable for height {}", height));
        }
        if self.garbage_filter_at == Some(height) {
            // claims 32 elements, then truncates; reading it errors instead
            // of merely not matching
            return Ok(FilterData {
                block_hash: block_hash(height),
                data: vec![0x20],
            });
        }
        let block = self.block(block_height);
        let elements = match kind {
            FilterKind::NewOutputs => &block.new_filter_elements,
            FilterKind::SpentOutpoints => &block.spent_filter_elements,
        };
        let blkhash = block_hash(height);
        Ok(FilterData {
            block_hash: blkhash,
            data: build_filter(&blkhash, elements),
        })
    }

    async fn utxos(&self, block_height: Height) -> Result<Vec<UtxoData>> {
        self.calls.utxos.fetch_add(1, Ordering::Relaxed);
        Ok(self.block(block_height).utxos)
    }

    async fn spent_index(&self, block_height: Height) -> Result<SpentIndexData> {
        self.calls.spent_index.fetch_add(1, Ordering::Relaxed);
        Ok(SpentIndexData {
            data: self.block(block_height).spent_index,
        })
    }
}

/// Updater that records every event for later assertions.
#[derive(Default)]
pub struct RecordingUpdater {
    pub progress: Mutex<Vec<u32>>,
    pub utxo_updates: AtomicUsize,
}

impl RecordingUpdater {
    pub fn heights(&self) -> Vec<u32> {
        self.progress.lock().unwrap().clone()
    }

    pub fn inserted(&self) -> usize {
        self.utxo_updates.load(Ordering::Relaxed)
    }
}

impl Updater for RecordingUpdater {
    fn send_scan_progress(&self, current: Height) {
        self.progress
            .lock()
            .unwrap()
            .push(current.to_consensus_u32());
    }

    fn send_utxo_update(&self, inserted: usize) {
        self.utxo_updates.fetch_add(inserted, Ordering::Relaxed);
    }
}
