use crate::blockchain::core::state::UtxoSet;
use crate::crypto;
use crate::error::ChainError;
use crate::transaction::Transaction;
use std::collections::HashMap;
use tracing::warn;

/// Rejects a set of transactions in which two inputs consume the same output.
pub fn validate_no_double_spend(transactions: &[Transaction]) -> Result<(), ChainError> {
    let mut seen_inputs: HashMap<(Vec<u8>, i64), Vec<u8>> = HashMap::new();
    for tx in transactions.iter().filter(|tx| !tx.is_coinbase()) {
        for input in &tx.inputs {
            let outpoint = (input.prev_tx_id.clone(), input.out_index);
            if let Some(conflicting_tx) = seen_inputs.get(&outpoint) {
                return Err(ChainError::DoubleSpendDetected(format!(
                    "Output {}:{} is spent by both {} and {}",
                    input.prev_tx_id_hex(),
                    input.out_index,
                    hex::encode(conflicting_tx),
                    tx.id_hex()
                )));
            }
            seen_inputs.insert(outpoint, tx.id.clone());
        }
    }
    Ok(())
}

/// Checks a transaction against the UTXO index: every input must spend an
/// indexed output locked to the input's key, and inputs must cover outputs.
pub fn validate_against_utxo(utxo: &UtxoSet, tx: &Transaction) -> Result<(), ChainError> {
    if tx.is_coinbase() {
        return Ok(());
    }
    validate_no_double_spend(std::slice::from_ref(tx))?;

    let mut input_total = 0u64;
    for input in &tx.inputs {
        let output = utxo
            .find_output(&input.prev_tx_id, input.out_index)?
            .ok_or_else(|| {
                ChainError::DoubleSpendDetected(format!(
                    "Output {}:{} is spent or unknown",
                    input.prev_tx_id_hex(),
                    input.out_index
                ))
            })?;
        if !output.is_locked_with_key(&crypto::public_key_hash(&input.public_key)) {
            return Err(ChainError::InvalidTransaction(format!(
                "Input key does not unlock {}:{}",
                input.prev_tx_id_hex(),
                input.out_index
            )));
        }
        input_total = input_total.saturating_add(output.value);
    }

    let output_total = tx.output_total()?;
    if input_total < output_total {
        return Err(ChainError::InsufficientFunds {
            needed: output_total,
            available: input_total,
        });
    }
    Ok(())
}

/// Full inclusion check for one transaction: signatures against the ledger,
/// then spendability against the index.
pub fn validate_transaction(utxo: &UtxoSet, tx: &Transaction) -> Result<(), ChainError> {
    if !utxo.blockchain().verify_transaction(tx)? {
        return Err(ChainError::InvalidTransaction(format!(
            "Signature check failed for {}",
            tx.id_hex()
        )));
    }
    validate_against_utxo(utxo, tx)
}

/// Keeps, in order, the transactions that pass `validate_transaction` and do
/// not conflict with one already kept. Dropped ones are logged.
pub fn select_includable(utxo: &UtxoSet, candidates: Vec<Transaction>) -> Vec<Transaction> {
    let mut selected: Vec<Transaction> = Vec::with_capacity(candidates.len());

    for tx in candidates {
        if let Err(e) = validate_transaction(utxo, &tx) {
            warn!("Dropping transaction {}: {}", tx.id_hex(), e);
            continue;
        }

        selected.push(tx);
        if let Err(e) = validate_no_double_spend(&selected) {
            warn!("Dropping conflicting transaction: {}", e);
            selected.pop();
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::core::chain::Blockchain;
    use crate::crypto::KeyPair;
    use crate::persistence::{InMemoryStore, KvStore};
    use crate::transaction::TxOutput;
    use std::sync::Arc;

    fn setup() -> (UtxoSet, KeyPair) {
        let alice = KeyPair::generate().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let chain = Arc::new(Blockchain::init(store, &alice.address()).unwrap());
        let utxo = UtxoSet::new(chain);
        utxo.reindex().unwrap();
        (utxo, alice)
    }

    #[test]
    fn test_valid_transfer_passes() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 5, &utxo)
            .unwrap();
        assert!(validate_transaction(&utxo, &tx).is_ok());
    }

    #[test]
    fn test_conflicting_spends_keep_first() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let carol = KeyPair::generate().unwrap();
        let to_bob = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 5, &utxo)
            .unwrap();
        let to_carol =
            Transaction::new_transfer(&alice, &alice.address(), &carol.address(), 5, &utxo)
                .unwrap();

        assert!(matches!(
            validate_no_double_spend(&[to_bob.clone(), to_carol.clone()]),
            Err(ChainError::DoubleSpendDetected(_))
        ));

        let kept = select_includable(&utxo, vec![to_bob.clone(), to_carol]);
        assert_eq!(kept, vec![to_bob]);
    }

    #[test]
    fn test_spent_output_rejected_after_commit() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 5, &utxo)
            .unwrap();

        let (block, outcome) = utxo
            .blockchain()
            .forge_block(vec![tx.clone()], &alice.address())
            .unwrap();
        utxo.apply_append(&block, outcome).unwrap();

        assert!(matches!(
            validate_against_utxo(&utxo, &tx),
            Err(ChainError::DoubleSpendDetected(_))
        ));
    }

    #[test]
    fn test_inflated_outputs_rejected() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let mut tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 20, &utxo)
            .unwrap();
        tx.outputs[0].value = 25;

        assert_eq!(
            validate_against_utxo(&utxo, &tx),
            Err(ChainError::InsufficientFunds {
                needed: 25,
                available: 20
            })
        );
        assert!(matches!(
            validate_transaction(&utxo, &tx),
            Err(ChainError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_overflowing_outputs_rejected() {
        let (utxo, alice) = setup();
        let bob = KeyPair::generate().unwrap();
        let mut tx = Transaction::new_transfer(&alice, &alice.address(), &bob.address(), 20, &utxo)
            .unwrap();
        tx.outputs[0].value = u64::MAX;
        tx.outputs.push(TxOutput::new(1, &bob.address()).unwrap());

        assert!(matches!(
            validate_against_utxo(&utxo, &tx),
            Err(ChainError::InvalidTransaction(_))
        ));
        assert!(select_includable(&utxo, vec![tx]).is_empty());
    }
}
