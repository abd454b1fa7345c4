/// Signing and signature verification, separated from the type definitions
use crate::crypto::{self, KeyPair};
use crate::error::ChainError;
use crate::transaction::types::{Transaction, TxInput, TxOutput};
use std::collections::HashMap;

impl Transaction {
    /// Copy with every signature and public key cleared. Signing payloads are
    /// derived from this by filling in one input's locking hash at a time.
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_tx_id: input.prev_tx_id.clone(),
                sender_address: input.sender_address.clone(),
                out_index: input.out_index,
                signature: Vec::new(),
                public_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Signs every input with `key`. `prev_txs` maps hex txid to the
    /// transaction whose output each input spends.
    pub fn sign(
        &mut self,
        key: &KeyPair,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<(), ChainError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let referenced = self.referenced_outputs(prev_txs)?;
        let mut copy = self.trimmed_copy();

        for (index, locked) in referenced.iter().enumerate() {
            let Some(locked) = locked else {
                return Err(ChainError::InvalidTransaction(format!(
                    "Input {} references missing output {} of {}",
                    index,
                    self.inputs[index].out_index,
                    self.inputs[index].prev_tx_id_hex()
                )));
            };

            copy.inputs[index].public_key = locked.pub_key_hash.clone();
            let payload = copy.hash()?;
            copy.inputs[index].public_key = Vec::new();

            self.inputs[index].signature = key.sign(&payload)?.to_vec();
        }

        Ok(())
    }

    /// Checks every input's signature against the output it spends.
    ///
    /// `Ok(false)` means the transaction is invalid. An input whose previous
    /// transaction is absent from `prev_txs` is an error, not a rejection.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool, ChainError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let referenced = self.referenced_outputs(prev_txs)?;
        let mut copy = self.trimmed_copy();

        for (index, input) in self.inputs.iter().enumerate() {
            let Some(locked) = referenced[index] else {
                return Ok(false);
            };
            if !locked.is_locked_with_key(&crypto::public_key_hash(&input.public_key)) {
                return Ok(false);
            }

            copy.inputs[index].public_key = locked.pub_key_hash.clone();
            let payload = copy.hash()?;
            copy.inputs[index].public_key = Vec::new();

            if crypto::verify_signature(&input.public_key, &payload, &input.signature).is_err() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Resolves the output each input spends; `None` where the index is out of range.
    fn referenced_outputs<'a>(
        &self,
        prev_txs: &'a HashMap<String, Transaction>,
    ) -> Result<Vec<Option<&'a TxOutput>>, ChainError> {
        self.inputs
            .iter()
            .map(|input| {
                let prev = prev_txs
                    .get(&input.prev_tx_id_hex())
                    .filter(|tx| !tx.id.is_empty())
                    .ok_or_else(|| {
                        ChainError::UnknownPreviousTransaction(input.prev_tx_id_hex())
                    })?;
                Ok(usize::try_from(input.out_index)
                    .ok()
                    .and_then(|i| prev.outputs.get(i)))
            })
            .collect()
    }
}
