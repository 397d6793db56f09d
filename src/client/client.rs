use std::collections::HashMap;

use anyhow::Result;
use bitcoin::{
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    Network,
};
use log::warn;
use serde::{Deserialize, Serialize};

use silentpayments::receiving::{Label, Receiver};
use silentpayments::utils as sp_utils;
use silentpayments::Network as SpNetwork;

use super::SpendKey;

/// Wallet-side key material for receiving silent payments.
///
/// Holds the scan secret key and the spend key (possibly watch-only), plus
/// the BIP352 `Receiver` wired with the mandatory change label (m=0) and any
/// additional labels the wallet uses.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct SpClient {
    scan_sk: SecretKey,
    spend_key: SpendKey,
    pub sp_receiver: Receiver,
    network: Network,
}

impl SpClient {
    /// `extra_labels` are the label indices beyond the change label, m >= 1.
    pub fn new(
        scan_sk: SecretKey,
        spend_key: SpendKey,
        extra_labels: &[u32],
        network: Network,
    ) -> Result<Self> {
        let secp = Secp256k1::signing_only();
        let scan_pubkey = scan_sk.public_key(&secp);
        let spend_pubkey: PublicKey = (&spend_key).into();
        let change_label = Label::new(scan_sk, 0);

        let sp_network = match network {
            Network::Bitcoin => SpNetwork::Mainnet,
            Network::Regtest => SpNetwork::Regtest,
            Network::Testnet | Network::Signet => SpNetwork::Testnet,
            _ => unreachable!(),
        };

        let mut sp_receiver = Receiver::new(
            0,
            scan_pubkey,
            spend_pubkey,
            change_label.into(),
            sp_network,
        )?;

        for m in extra_labels {
            sp_receiver.add_label(Label::new(scan_sk, *m))?;
        }

        Ok(Self {
            scan_sk,
            spend_key,
            sp_receiver,
            network,
        })
    }

    pub fn get_receiving_address(&self) -> String {
        self.sp_receiver.get_receiving_address().to_string()
    }

    pub fn get_scan_key(&self) -> SecretKey {
        self.scan_sk
    }

    pub fn get_spend_key(&self) -> SpendKey {
        self.spend_key.clone()
    }

    pub fn get_network(&self) -> Network {
        self.network
    }

    /// Derive every candidate output script for a batch of tweaks.
    ///
    /// For each tweak this computes the ECDH shared secret with the scan key
    /// and the candidate scripts for the base output and every label variant
    /// (both signs). Derivation is independent per tweak and runs on the
    /// rayon pool. A tweak whose derivation fails is dropped from the
    /// candidate set; the rest of the batch is unaffected.
    pub fn get_script_to_secret_map(
        &self,
        tweaks: &[PublicKey],
    ) -> HashMap<[u8; 34], PublicKey> {
        use rayon::prelude::*;
        let b_scan = self.get_scan_key();

        tweaks
            .par_iter()
            .filter_map(|tweak| {
                let secret = sp_utils::receiving::calculate_ecdh_shared_secret(tweak, &b_scan);
                match self.sp_receiver.get_spks_from_shared_secret(&secret) {
                    Ok(spks) => Some(
                        spks.into_values()
                            .map(|spk| (spk, secret))
                            .collect::<Vec<_>>(),
                    ),
                    Err(e) => {
                        warn!("dropping tweak {} from candidate derivation: {}", tweak, e);
                        None
                    }
                }
            })
            .flatten()
            .collect()
    }
}
