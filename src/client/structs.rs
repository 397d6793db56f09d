use anyhow::Error;
use bitcoin::{
    absolute::Height,
    key::Secp256k1,
    secp256k1::{PublicKey, SecretKey},
    Amount, ScriptBuf,
};
use serde::{Deserialize, Serialize};
use silentpayments::receiving::Label;

/// Lifecycle of an owned output. Transitions only move forward; `Spent` is
/// terminal.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum OutputSpendStatus {
    /// Seen in the mempool but not yet mined.
    Unconfirmed,
    /// Mined and not known to be spent.
    Unspent,
    /// A spend of this output is in the mempool.
    UnconfirmedSpent,
    /// A spend of this output is mined.
    Spent,
}

impl OutputSpendStatus {
    pub fn is_spent(&self) -> bool {
        matches!(self, OutputSpendStatus::Spent)
    }
}

/// An output the exact scan confirmed as belonging to the wallet.
///
/// Identity is the outpoint; the set manager keys entries by `OutPoint` and
/// never stores the same outpoint twice.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OwnedUtxo {
    pub block_height: Height,
    /// Scalar to add to the spend key to spend this output, big endian.
    pub tweak: [u8; 32],
    pub amount: Amount,
    pub script: ScriptBuf,
    pub timestamp: u64,
    #[serde(with = "label_serde")]
    pub label: Option<Label>,
    pub spend_status: OutputSpendStatus,
}

/// Labels serialize as the hex of their scalar, the same form
/// `Label::try_from` accepts.
mod label_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use silentpayments::receiving::Label;

    pub fn serialize<S>(label: &Option<Label>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match label {
            Some(label) => serializer.serialize_some(&label.as_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Label>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex: Option<String> = Option::deserialize(deserializer)?;
        hex.map(Label::try_from)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

impl OwnedUtxo {
    /// Transition to `Spent`. A no-op when the output is already spent.
    pub fn mark_spent(&mut self) {
        if !self.spend_status.is_spent() {
            self.spend_status = OutputSpendStatus::Spent;
        }
    }
}

/// The wallet's spend key, which a watch-only instance only knows the public
/// half of.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum SpendKey {
    Secret(SecretKey),
    Public(PublicKey),
}

impl TryFrom<SpendKey> for SecretKey {
    type Error = Error;
    fn try_from(value: SpendKey) -> Result<SecretKey, Error> {
        match value {
            SpendKey::Secret(k) => Ok(k),
            SpendKey::Public(_) => Err(Error::msg("Can't take SecretKey from Public")),
        }
    }
}

impl From<&SpendKey> for PublicKey {
    fn from(value: &SpendKey) -> Self {
        match value {
            SpendKey::Secret(k) => {
                let secp = Secp256k1::signing_only();
                k.public_key(&secp)
            }
            SpendKey::Public(p) => *p,
        }
    }
}
