//! The authoritative in-memory transaction record store.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sierra_core::{
    SiError, SiResult, TransitionOutcome, Txn, TxnId, TxnStore, TxnTransition, TxnView,
};

/// Transaction record store backed by a concurrent hash map.
///
/// Each record is mutated only under its own map entry lock, which is what
/// makes lifecycle transitions atomic: when two callers race to finish the
/// same transaction, one applies its transition first and the other
/// observes the winner's terminal state.
#[derive(Debug, Default)]
pub struct InMemoryTxnStore {
    txns: DashMap<TxnId, Txn>,
}

impl InMemoryTxnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}

impl TxnStore for InMemoryTxnStore {
    fn record_new_transaction(&self, txn: Txn) -> SiResult<()> {
        match self.txns.entry(txn.id()) {
            Entry::Occupied(_) => Err(SiError::DuplicateTransaction(txn.id())),
            Entry::Vacant(slot) => {
                slot.insert(txn);
                Ok(())
            }
        }
    }

    fn get_transaction(&self, id: TxnId, fetch_destination_tables: bool) -> SiResult<TxnView> {
        self.txns
            .get(&id)
            .map(|txn| txn.view(fetch_destination_tables))
            .ok_or(SiError::TransactionNotFound(id))
    }

    fn register_destination_table(&self, id: TxnId, table: Vec<u8>) -> SiResult<()> {
        let mut txn = self
            .txns
            .get_mut(&id)
            .ok_or(SiError::TransactionNotFound(id))?;
        txn.add_destination_table(table);
        Ok(())
    }

    fn get_transaction_from_cache(&self, _id: TxnId) -> Option<TxnView> {
        None
    }

    fn transition(&self, id: TxnId, transition: TxnTransition) -> SiResult<TransitionOutcome> {
        let mut txn = self
            .txns
            .get_mut(&id)
            .ok_or(SiError::TransactionNotFound(id))?;
        txn.apply(transition)
    }
}
