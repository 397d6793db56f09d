//! Block-scanning pipeline: candidate derivation, filter gating, concurrent
//! fetch/process and strictly ordered finalization.
//!
//! Oracle round-trips dominate scan latency, so fetching and processing run
//! in parallel and may complete in any order. All wallet-state mutation
//! happens in a single ordered finish stage: a spend in block N can only be
//! evaluated once block N's own additions are applied, so heights are
//! finalized strictly in increasing order through a backlog buffer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use anyhow::{Error, Result};
use bitcoin::{
    absolute::Height,
    bip158::BlockFilter,
    hashes::{sha256, Hash, HashEngine},
    secp256k1::PublicKey,
    Amount, BlockHash, OutPoint, Txid, XOnlyPublicKey,
};
use futures::{stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::{
    backend::{BlockData, ChainBackend, FilterKind, UtxoData},
    client::{OutputSpendStatus, OwnedUtxo, SpClient},
    constants::{
        BLOCK_CHANNEL_SIZE, DEFAULT_CONCURRENT_BLOCK_FETCHES, DEFAULT_DUST_LIMIT_SATS,
        DEFAULT_POLL_INTERVAL_SECS, DEFAULT_STOP_TIMEOUT_SECS, PROCESSED_CHANNEL_SIZE,
    },
    updater::Updater,
    wallet::WalletState,
};

/// Per-instance tuning of the pipeline. Explicit constructor input rather
/// than process-wide globals, so tests stay deterministic and instances
/// independent.
#[derive(Debug, Clone)]
pub struct ScannerOptions {
    /// Upper bound on concurrently outstanding block fetches.
    pub concurrent_block_fetches: usize,
    /// Dust limit forwarded to the oracle's tweak endpoint.
    pub dust_limit: Amount,
    /// Sleep between sync cycles while following the tip.
    pub poll_interval: Duration,
    /// How long `stop_sync` waits for the background loop.
    pub stop_timeout: Duration,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
            concurrent_block_fetches: DEFAULT_CONCURRENT_BLOCK_FETCHES,
            dust_limit: Amount::from_sat(DEFAULT_DUST_LIMIT_SATS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
        }
    }
}

/// A block that went through the process stage, waiting for ordered
/// finalization.
struct ProcessedBlock {
    data: BlockData,
    found_outputs: Vec<(OutPoint, OwnedUtxo)>,
}

/// Silent payments block scanner.
///
/// Fetch and process stages are purely functional over their inputs; the
/// owned-UTXO set and the scan cursor are only touched by the finish stage
/// under the wallet mutex.
pub struct SpScanner {
    client: SpClient,
    backend: Arc<dyn ChainBackend>,
    wallet: Arc<Mutex<WalletState>>,
    updater: Arc<dyn Updater>,
    options: ScannerOptions,
    interrupt: Arc<AtomicBool>,
}

impl SpScanner {
    pub fn new(
        client: SpClient,
        backend: Arc<dyn ChainBackend>,
        wallet: Arc<Mutex<WalletState>>,
        updater: Arc<dyn Updater>,
        options: ScannerOptions,
    ) -> Self {
        Self {
            client,
            backend,
            wallet,
            updater,
            options,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn options(&self) -> &ScannerOptions {
        &self.options
    }

    pub fn should_interrupt(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub(crate) fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub(crate) fn wallet_handle(&self) -> Arc<Mutex<WalletState>> {
        Arc::clone(&self.wallet)
    }

    /// Scan from the wallet's cursor up to the oracle's chain tip. Returns
    /// immediately when the cursor is already at the tip.
    pub async fn sync_to_tip(&self) -> Result<()> {
        let tip = self.backend.block_height().await?.to_consensus_u32();
        let start = { self.wallet.lock().unwrap().next_scan_height() };
        if start > tip {
            debug!("cursor past tip {}, nothing to scan", tip);
            return Ok(());
        }
        self.scan_blocks(start, tip).await
    }

    /// Run the three-stage pipeline over an inclusive height range.
    ///
    /// Any fetch or process error aborts the whole scan with that error.
    /// An observed stop request winds the pipeline down and returns `Ok`.
    pub async fn scan_blocks(&self, start: u32, end: u32) -> Result<()> {
        if start > end {
            return Err(Error::msg("scan start height is above end height"));
        }
        info!("scanning blocks {} through {}", start, end);

        let (block_tx, mut block_rx) = mpsc::channel::<BlockData>(BLOCK_CHANNEL_SIZE);
        let (processed_tx, mut processed_rx) =
            mpsc::channel::<ProcessedBlock>(PROCESSED_CHANNEL_SIZE);

        // fetch stage: bounded pool of oracle round-trips, results arrive in
        // completion order
        let backend = Arc::clone(&self.backend);
        let interrupt = Arc::clone(&self.interrupt);
        let dust_limit = self.options.dust_limit;
        let concurrency = self.options.concurrent_block_fetches;
        let fetch_handle = tokio::spawn(async move {
            let mut blocks = stream::iter(start..=end)
                .map(|height| {
                    let backend = Arc::clone(&backend);
                    let interrupt = Arc::clone(&interrupt);
                    async move {
                        if interrupt.load(Ordering::Relaxed) {
                            return Ok(None);
                        }
                        fetch_block_data(backend.as_ref(), height, dust_limit)
                            .await
                            .map(Some)
                    }
                })
                .buffer_unordered(concurrency);

            while let Some(result) = blocks.next().await {
                match result {
                    Ok(Some(blockdata)) => {
                        if block_tx.send(blockdata).await.is_err() {
                            // downstream stage is gone, wind down quietly
                            break;
                        }
                    }
                    Ok(None) => break, // stop observed
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        });

        // process stage: single task, completion may be out of height order
        let client = self.client.clone();
        let backend = Arc::clone(&self.backend);
        let interrupt = Arc::clone(&self.interrupt);
        let process_handle = tokio::spawn(async move {
            while let Some(blockdata) = block_rx.recv().await {
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }
                let found_outputs =
                    process_block_outputs(&client, backend.as_ref(), &blockdata).await?;
                let processed = ProcessedBlock {
                    data: blockdata,
                    found_outputs,
                };
                if processed_tx.send(processed).await.is_err() {
                    break;
                }
            }
            Ok::<(), Error>(())
        });

        // finish stage: strictly height-ordered, the only writer of shared
        // state
        let mut next_height = start;
        let mut backlog: BTreeMap<u32, ProcessedBlock> = BTreeMap::new();
        let mut finish_result: Result<()> = Ok(());
        'finish: while let Some(block) = processed_rx.recv().await {
            if self.should_interrupt() {
                break;
            }
            backlog.insert(block.data.blkheight.to_consensus_u32(), block);
            while let Some(block) = backlog.remove(&next_height) {
                if let Err(e) = self.finish_block(block).await {
                    finish_result = Err(e);
                    break 'finish;
                }
                next_height += 1;
            }
        }
        drop(processed_rx);

        let fetch_result = fetch_handle.await?;
        let process_result = process_handle.await?;

        finish_result?;
        fetch_result?;
        process_result?;
        Ok(())
    }

    /// Apply one block's effects to the wallet: spend markings, then new
    /// outputs, then the cursor. A height is only reported as finished once
    /// all three are done.
    async fn finish_block(&self, block: ProcessedBlock) -> Result<()> {
        let ProcessedBlock {
            data,
            found_outputs,
        } = block;
        let blkheight = data.blkheight;

        self.mark_spent_utxos(&data).await?;

        if !found_outputs.is_empty() {
            let inserted = {
                let mut wallet = self.wallet.lock().unwrap();
                wallet.store_mut().add_utxos_safely(found_outputs)
            };
            if inserted > 0 {
                info!("block {}: {} new owned utxos", blkheight, inserted);
                self.updater.send_utxo_update(inserted);
            }
        }

        {
            let mut wallet = self.wallet.lock().unwrap();
            wallet.set_last_scan(blkheight.to_consensus_u32());
        }
        self.updater.send_scan_progress(blkheight);
        Ok(())
    }

    /// Detect which owned outputs were spent in this block and transition
    /// them to `Spent`.
    ///
    /// Follows the same filter-then-index pattern as output detection: only
    /// when the truncated outpoint hashes match the spent filter is the full
    /// index fetched.
    async fn mark_spent_utxos(&self, blockdata: &BlockData) -> Result<()> {
        let input_hashes: HashMap<[u8; 8], OutPoint> = {
            let wallet = self.wallet.lock().unwrap();
            get_input_hashes(blockdata.blkhash, wallet.store().unspent_outpoints())
        };
        if input_hashes.is_empty() {
            return Ok(());
        }

        let filter = BlockFilter::new(&blockdata.spent_filter.data);
        let hashes: Vec<[u8; 8]> = input_hashes.keys().copied().collect();
        let matched = match check_block_inputs(filter, blockdata.blkhash, hashes) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(
                    "spent filter for block {} unreadable, checking index: {}",
                    blockdata.blkheight, e
                );
                true
            }
        };
        if !matched {
            return Ok(());
        }

        let index = self.backend.spent_index(blockdata.blkheight).await?;
        let spent: Vec<OutPoint> = index
            .data
            .iter()
            .filter_map(|hash| {
                let truncated: [u8; 8] = hash.get(..8)?.try_into().ok()?;
                input_hashes.get(&truncated).copied()
            })
            .collect();

        if !spent.is_empty() {
            let changed = {
                let mut wallet = self.wallet.lock().unwrap();
                wallet.store_mut().mark_spent(&spent)
            };
            info!("block {}: {} utxos spent", blockdata.blkheight, changed);
        }
        Ok(())
    }
}

/// Fetch everything needed to judge one block: both filters and the tweak
/// list, issued concurrently. The first failure aborts the height and
/// discards the other results.
pub(crate) async fn fetch_block_data(
    backend: &dyn ChainBackend,
    height: u32,
    dust_limit: Amount,
) -> Result<BlockData> {
    let blkheight = Height::from_consensus(height)?;
    let (new_utxo_filter, spent_filter, tweaks) = tokio::try_join!(
        backend.filter(blkheight, FilterKind::NewOutputs),
        backend.filter(blkheight, FilterKind::SpentOutpoints),
        backend.tweaks(blkheight, dust_limit),
    )?;
    let blkhash = new_utxo_filter.block_hash;
    Ok(BlockData {
        blkheight,
        blkhash,
        tweaks,
        new_utxo_filter,
        spent_filter,
    })
}

/// Find this block's owned outputs.
///
/// Candidate scripts derived from the tweaks are tested against the
/// new-outputs filter first; in the common no-match case the full output
/// list is never fetched. A match is only a hypothesis (GCS false positives)
/// and is always confirmed by the exact scan. An undecodable filter falls
/// through to the exact scan: a false negative here would be a permanently
/// missed payment.
async fn process_block_outputs(
    client: &SpClient,
    backend: &dyn ChainBackend,
    blockdata: &BlockData,
) -> Result<Vec<(OutPoint, OwnedUtxo)>> {
    if blockdata.tweaks.is_empty() {
        return Ok(Vec::new());
    }

    let secrets_map = client.get_script_to_secret_map(&blockdata.tweaks);
    let candidate_spks: Vec<&[u8; 34]> = secrets_map.keys().collect();

    let filter = BlockFilter::new(&blockdata.new_utxo_filter.data);
    let matched = match check_block_outputs(filter, blockdata.blkhash, candidate_spks) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(
                "new-outputs filter for block {} unreadable, running exact scan: {}",
                blockdata.blkheight, e
            );
            true
        }
    };
    if !matched {
        return Ok(Vec::new());
    }

    let utxos = backend.utxos(blockdata.blkheight).await?;
    scan_utxos(client, utxos, &secrets_map)
}

/// Run the exact BIP352 scan over a block's outputs and map the confirmed
/// hits to owned records.
fn scan_utxos(
    client: &SpClient,
    utxos: Vec<UtxoData>,
    secrets_map: &HashMap<[u8; 34], PublicKey>,
) -> Result<Vec<(OutPoint, OwnedUtxo)>> {
    let mut found = Vec::new();

    // the shared secret is per transaction, so group by txid
    let mut txmap: HashMap<Txid, Vec<UtxoData>> = HashMap::new();
    for utxo in utxos {
        txmap.entry(utxo.txid).or_default().push(utxo);
    }

    for utxos in txmap.into_values() {
        // check if we know the secret to any of the spks
        let mut secret = None;
        for utxo in utxos.iter() {
            if let Some(s) = secrets_map.get(utxo.scriptpubkey.as_bytes()) {
                secret = Some(s);
                break;
            }
        }

        let secret = match secret {
            Some(secret) => secret,
            None => continue,
        };

        let output_keys: Result<Vec<XOnlyPublicKey>> = utxos
            .iter()
            .filter_map(|x| {
                if x.scriptpubkey.is_p2tr() {
                    Some(
                        XOnlyPublicKey::from_slice(&x.scriptpubkey.as_bytes()[2..])
                            .map_err(Error::new),
                    )
                } else {
                    None
                }
            })
            .collect();

        let ours = client.sp_receiver.scan_transaction(secret, output_keys?)?;

        for utxo in utxos {
            if !utxo.scriptpubkey.is_p2tr() {
                continue;
            }
            let xonly = match XOnlyPublicKey::from_slice(&utxo.scriptpubkey.as_bytes()[2..]) {
                Ok(xonly) => xonly,
                Err(_) => continue,
            };
            for (label, map) in ours.iter() {
                if let Some(scalar) = map.get(&xonly) {
                    let spend_status = if utxo.spent {
                        OutputSpendStatus::Spent
                    } else {
                        OutputSpendStatus::Unspent
                    };
                    found.push((
                        OutPoint::new(utxo.txid, utxo.vout),
                        OwnedUtxo {
                            block_height: utxo.block_height,
                            tweak: scalar.to_be_bytes(),
                            amount: utxo.value,
                            script: utxo.scriptpubkey.clone(),
                            timestamp: utxo.timestamp,
                            label: label.clone(),
                            spend_status,
                        },
                    ));
                    break;
                }
            }
        }
    }

    Ok(found)
}

/// Check whether any candidate script key could be in the block.
fn check_block_outputs(
    created_utxo_filter: BlockFilter,
    blkhash: BlockHash,
    candidate_spks: Vec<&[u8; 34]>,
) -> Result<bool> {
    let output_keys: Vec<_> = candidate_spks
        .into_iter()
        .map(|spk| spk[2..].as_ref())
        .collect();

    // note: match will always return true for an empty query!
    if !output_keys.is_empty() {
        Ok(created_utxo_filter.match_any(&blkhash, &mut output_keys.into_iter())?)
    } else {
        Ok(false)
    }
}

/// Check whether any owned outpoint could be spent in the block.
fn check_block_inputs(
    spent_filter: BlockFilter,
    blkhash: BlockHash,
    input_hashes: Vec<[u8; 8]>,
) -> Result<bool> {
    // note: match will always return true for an empty query!
    if !input_hashes.is_empty() {
        Ok(spent_filter.match_any(&blkhash, &mut input_hashes.into_iter())?)
    } else {
        Ok(false)
    }
}

/// Truncated outpoint hashes for the spendable owned set, keyed back to the
/// outpoint they were computed from.
pub(crate) fn get_input_hashes(
    blkhash: BlockHash,
    outpoints: impl IntoIterator<Item = OutPoint>,
) -> HashMap<[u8; 8], OutPoint> {
    outpoints
        .into_iter()
        .map(|outpoint| (hash_outpoint(&outpoint, &blkhash), outpoint))
        .collect()
}

/// `SHA256(txid || vout_le || block_hash)[..8]`, txid and block hash in
/// internal byte order. Same derivation the oracle uses for its spent index.
fn hash_outpoint(outpoint: &OutPoint, blkhash: &BlockHash) -> [u8; 8] {
    let mut engine = sha256::HashEngine::default();
    engine.input(&outpoint.txid.to_byte_array());
    engine.input(&outpoint.vout.to_le_bytes());
    engine.input(&blkhash.to_byte_array());
    let hash = sha256::Hash::from_engine(engine);

    let mut truncated = [0u8; 8];
    truncated.copy_from_slice(&hash.to_byte_array()[..8]);
    truncated
}
