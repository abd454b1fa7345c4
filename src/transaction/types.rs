/// Transaction types for ForgeChain
use crate::blockchain::UtxoSet;
use crate::crypto::{self, KeyPair};
use crate::error::ChainError;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Out-index carried by the synthetic input of a coinbase transaction.
pub const COINBASE_OUT_INDEX: i64 = -1;

/// Size of the random memo generated for a coinbase without one.
pub const COINBASE_MEMO_BYTES: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_tx_id: Vec<u8>,
    pub sender_address: String,
    pub out_index: i64,
    pub signature: Vec<u8>,
    /// Compressed public key of the spender. Coinbase inputs carry their memo here.
    pub public_key: Vec<u8>,
}

impl TxInput {
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        crypto::public_key_hash(&self.public_key) == pub_key_hash
    }

    pub fn prev_tx_id_hex(&self) -> String {
        hex::encode(&self.prev_tx_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub address: String,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Creates an output locked to the public key hash encoded in `address`.
    pub fn new(value: u64, address: &str) -> Result<Self, ChainError> {
        let mut output = TxOutput {
            value,
            address: address.to_string(),
            pub_key_hash: Vec::new(),
        };
        output.lock(address)?;
        Ok(output)
    }

    pub fn lock(&mut self, address: &str) -> Result<(), ChainError> {
        self.pub_key_hash = crypto::pub_key_hash_from_address(address)?;
        Ok(())
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Issues `value` to `to` with no prior input. An empty memo is replaced
    /// by 24 random bytes so coinbases with equal payouts get distinct ids.
    pub fn coinbase(to: &str, memo: &str, value: u64) -> Result<Self, ChainError> {
        let memo = if memo.is_empty() {
            let mut random = [0u8; COINBASE_MEMO_BYTES];
            OsRng
                .try_fill_bytes(&mut random)
                .map_err(|e| ChainError::CryptoError(format!("Randomness unavailable: {}", e)))?;
            hex::encode(random)
        } else {
            memo.to_string()
        };

        let input = TxInput {
            prev_tx_id: Vec::new(),
            sender_address: String::new(),
            out_index: COINBASE_OUT_INDEX,
            signature: Vec::new(),
            public_key: memo.into_bytes(),
        };
        let output = TxOutput::new(value, to)?;

        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![input],
            outputs: vec![output],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Builds and signs a payment of `amount` from `sender` to `receiver`,
    /// spending outputs locked to `key` as reported by the UTXO index.
    pub fn new_transfer(
        key: &KeyPair,
        sender: &str,
        receiver: &str,
        amount: u64,
        utxo: &UtxoSet,
    ) -> Result<Self, ChainError> {
        crypto::pub_key_hash_from_address(sender)?;
        crypto::pub_key_hash_from_address(receiver)?;
        let from = key.address();
        if from != sender {
            return Err(ChainError::InvalidTransaction(format!(
                "Sender {} does not match signing key address {}",
                sender, from
            )));
        }

        let pub_key_hash = key.public_key_hash();
        let (accumulated, spendable) = utxo.find_spendable_outputs(&pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(ChainError::InsufficientFunds {
                needed: amount,
                available: accumulated,
            });
        }

        let public_key = key.public_key_bytes().to_vec();
        let mut inputs = Vec::new();
        for (tx_id, out_indices) in &spendable {
            let prev_tx_id = hex::decode(tx_id)
                .map_err(|e| ChainError::InvalidTransaction(format!("Bad txid {}: {}", tx_id, e)))?;
            for &out_index in out_indices {
                inputs.push(TxInput {
                    prev_tx_id: prev_tx_id.clone(),
                    sender_address: sender.to_string(),
                    out_index,
                    signature: Vec::new(),
                    public_key: public_key.clone(),
                });
            }
        }

        let mut outputs = vec![TxOutput::new(amount, receiver)?];
        if accumulated > amount {
            outputs.push(TxOutput {
                value: accumulated - amount,
                address: from,
                pub_key_hash,
            });
        }

        let mut tx = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        tx.id = tx.hash()?;
        utxo.blockchain().sign_transaction(&mut tx, key)?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_tx_id.is_empty()
            && self.inputs[0].out_index == COINBASE_OUT_INDEX
    }

    /// Content hash of the transaction with its id field cleared.
    pub fn hash(&self) -> Result<Vec<u8>, ChainError> {
        let mut copy = self.clone();
        copy.id = Vec::new();
        Ok(crypto::sha256(&copy.serialize()?).to_vec())
    }

    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    /// Address of the first input's sender. Stake proposals are attributed to it.
    pub fn proposer(&self) -> Option<&str> {
        self.inputs.first().map(|i| i.sender_address.as_str())
    }

    /// Sum of all output values. Fails if it does not fit in a `u64`.
    pub fn output_total(&self) -> Result<u64, ChainError> {
        self.outputs.iter().try_fold(0u64, |total, o| {
            total.checked_add(o.value).ok_or_else(|| {
                ChainError::InvalidTransaction(format!("Output total of {} overflows", self.id_hex()))
            })
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ChainError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, ChainError> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", self.id_hex())?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:      {}", input.prev_tx_id_hex())?;
            writeln!(f, "       Out:       {}", input.out_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.public_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:  {}", output.value)?;
            write!(f, "       Script: {}", hex::encode(&output.pub_key_hash))?;
            if i + 1 < self.outputs.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
