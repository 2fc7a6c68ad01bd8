//! Write transaction state: decoded row operations, their per-row
//! outcomes, and the row locks held while they apply.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::clock::Timestamp;
use crate::consensus::OpId;
use crate::log::{OperationResult, RowOperation, TxResult};
use crate::{Error, Result};

/// Grants exclusive row locks, keyed by encoded row key.
#[derive(Debug, Default)]
pub struct LockManager {
    locked: Mutex<HashSet<Bytes>>,
}

impl LockManager {
    /// Create an empty lock manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock on a row key. Fails if the key is held.
    pub fn lock_row(self: &Arc<Self>, key: Bytes) -> Result<RowLock> {
        let mut locked = self.locked.lock();
        if !locked.insert(key.clone()) {
            return Err(Error::illegal_state(format!(
                "row {:?} is already locked",
                key
            )));
        }
        Ok(RowLock {
            manager: Arc::clone(self),
            key,
        })
    }

    /// Number of currently held locks.
    pub fn num_locked(&self) -> usize {
        self.locked.lock().len()
    }
}

/// An exclusive lock on one row, released on drop.
#[derive(Debug)]
pub struct RowLock {
    manager: Arc<LockManager>,
    key: Bytes,
}

impl Drop for RowLock {
    fn drop(&mut self) {
        self.manager.locked.lock().remove(&self.key);
    }
}

/// One decoded row operation and its (eventual) outcome.
#[derive(Debug)]
pub struct RowOp {
    op: RowOperation,
    result: Option<OperationResult>,
}

impl RowOp {
    /// Wrap a decoded operation with no outcome yet.
    pub fn new(op: RowOperation) -> Self {
        Self { op, result: None }
    }

    /// The decoded operation.
    pub fn op(&self) -> &RowOperation {
        &self.op
    }

    /// The outcome, if decided.
    pub fn result(&self) -> Option<&OperationResult> {
        self.result.as_ref()
    }

    /// Whether an outcome has been decided.
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Record a failure outcome.
    pub fn set_failed(&mut self, message: impl Into<String>) {
        self.result = Some(OperationResult::failed(message));
    }

    /// Record an outcome.
    pub fn set_result(&mut self, result: OperationResult) {
        self.result = Some(result);
    }
}

/// State of one write as it is prepared and applied.
///
/// Owns the decoded operations (in original request order), the row
/// locks, and the per-row outcomes from which the final result is
/// materialized.
#[derive(Debug)]
pub struct WriteTransactionState {
    op_id: OpId,
    timestamp: Timestamp,
    row_ops: Vec<RowOp>,
    locks: Vec<RowLock>,
    anchored: bool,
}

impl WriteTransactionState {
    /// Create state for the write identified by `op_id`.
    pub fn new(op_id: OpId, timestamp: Timestamp) -> Self {
        Self {
            op_id,
            timestamp,
            row_ops: Vec::new(),
            locks: Vec::new(),
            anchored: false,
        }
    }

    /// The write's op id.
    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    /// The timestamp assigned to this write.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The decoded row operations.
    pub fn row_ops(&self) -> &[RowOp] {
        &self.row_ops
    }

    /// Mutable access to the decoded row operations.
    pub fn row_ops_mut(&mut self) -> &mut [RowOp] {
        &mut self.row_ops
    }

    /// Install the decoded operations. Replaces any previous set.
    pub(crate) fn set_row_ops(&mut self, ops: Vec<RowOp>) {
        self.row_ops = ops;
    }

    /// Hold a row lock for the duration of this write.
    pub(crate) fn add_lock(&mut self, lock: RowLock) {
        self.locks.push(lock);
    }

    /// Whether this write has registered a log anchor.
    pub(crate) fn is_anchored(&self) -> bool {
        self.anchored
    }

    /// Note that this write registered a log anchor.
    pub(crate) fn set_anchored(&mut self) {
        self.anchored = true;
    }

    /// Materialize the final per-row result, in original order.
    ///
    /// Every operation must have an outcome by the time this is called.
    pub fn take_result(&mut self) -> Result<TxResult> {
        let mut ops = Vec::with_capacity(self.row_ops.len());
        for (idx, row_op) in self.row_ops.iter_mut().enumerate() {
            match row_op.result.take() {
                Some(result) => ops.push(result),
                None => {
                    return Err(Error::illegal_state(format!(
                        "row op {} of write {} has no result",
                        idx, self.op_id
                    )));
                }
            }
        }
        Ok(TxResult::new(ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemStoreTarget;

    #[test]
    fn test_lock_manager_exclusive() {
        let manager = LockManager::new();

        let lock = manager.lock_row(Bytes::from("a")).unwrap();
        assert!(manager.lock_row(Bytes::from("a")).is_err());
        assert_eq!(manager.num_locked(), 1);

        drop(lock);
        assert_eq!(manager.num_locked(), 0);
        manager.lock_row(Bytes::from("a")).unwrap();
    }

    #[test]
    fn test_take_result_preserves_order() {
        let mut tx = WriteTransactionState::new(OpId::new(1, 1), Timestamp(1));
        let mut op_a = RowOp::new(RowOperation::Delete {
            key: Bytes::from("a"),
        });
        op_a.set_failed("row not found");
        let mut op_b = RowOp::new(RowOperation::Delete {
            key: Bytes::from("b"),
        });
        op_b.set_result(OperationResult::applied(MemStoreTarget::Mrs { mrs_id: 1 }));
        tx.set_row_ops(vec![op_a, op_b]);

        let result = tx.take_result().unwrap();
        assert_eq!(result.ops.len(), 2);
        assert!(result.ops[0].is_failed());
        assert!(!result.ops[1].is_failed());
    }

    #[test]
    fn test_take_result_requires_all_outcomes() {
        let mut tx = WriteTransactionState::new(OpId::new(1, 1), Timestamp(1));
        tx.set_row_ops(vec![RowOp::new(RowOperation::Delete {
            key: Bytes::from("a"),
        })]);
        assert!(tx.take_result().is_err());
    }
}
