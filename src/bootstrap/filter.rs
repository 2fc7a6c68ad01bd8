//! Durability filtering of replayed row operations.
//!
//! Every row-level effect recorded in a commit names the in-memory
//! store it landed in. Comparing that target against the durability
//! watermarks in the tablet metadata decides, per row, whether the
//! effect already reached disk (skip it) or only ever lived in memory
//! (re-apply it).

use tracing::{debug, warn};

use crate::log::{MemStoreTarget, OperationResult, RowOperation, TxResult};
use crate::metrics::MetricContext;
use crate::tablet::{Tablet, TabletMetadata, WriteTransactionState};
use crate::{Error, Result};

/// Was the store a row-level effect landed in already flushed?
///
/// - A memrowset target is flushed iff its id is at or below the last
///   durable memrowset id.
/// - A delta-memstore target is flushed iff its id is at or below its
///   rowset's last durable redo delta id. A rowset missing from the
///   metadata was compacted away, which implies its deltas reached disk.
pub(crate) fn was_store_already_flushed(meta: &TabletMetadata, target: &MemStoreTarget) -> bool {
    match *target {
        MemStoreTarget::Mrs { mrs_id } => mrs_id <= meta.last_durable_mrs_id(),
        MemStoreTarget::Drs { rs_id, dms_id } => match meta.rowset(rs_id) {
            None => true,
            Some(rowset) => dms_id <= rowset.last_durable_redo_dms_id,
        },
    }
}

/// Pass through all decoded operations of a replayed write. For each op:
/// - if it failed in the original transaction, mark it failed;
/// - if it succeeded but its effects were flushed, mark it skipped;
/// - otherwise re-apply it to the tablet being bootstrapped.
pub(crate) fn filter_and_apply_operations(
    tablet: &Tablet,
    tx: &mut WriteTransactionState,
    orig_result: &TxResult,
    metrics: &MetricContext,
) -> Result<()> {
    if tx.row_ops().len() != orig_result.ops.len() {
        return Err(Error::corruption(format!(
            "write {} decoded {} row ops but its commit records {} results",
            tx.op_id(),
            tx.row_ops().len(),
            orig_result.ops.len()
        )));
    }

    for op_idx in 0..tx.row_ops().len() {
        let op_result = &orig_result.ops[op_idx];

        if let OperationResult::Failed { message } = op_result {
            debug!(
                op_id = %tx.op_id(),
                op_idx,
                original_error = %message,
                "skipping operation that originally resulted in error"
            );
            tx.row_ops_mut()[op_idx].set_failed("row operation failed previously");
            continue;
        }

        let is_insert = matches!(tx.row_ops()[op_idx].op(), RowOperation::Insert { .. });
        if is_insert {
            filter_insert(tablet, tx, op_idx, op_result)?;
        } else {
            filter_mutate(tablet, tx, op_idx, op_result)?;
        }
        if tx.row_ops()[op_idx].has_result() {
            metrics.bootstrap().ops_already_flushed.inc();
            continue;
        }

        // Not filtered: actually apply it.
        tablet.apply_row_operation(tx, op_idx)?;
        metrics.bootstrap().ops_applied.inc();

        // The apply must succeed: it succeeded before the restart. A
        // failure here means replay has diverged from the prior state.
        match tx.row_ops()[op_idx].result() {
            Some(OperationResult::Failed { message }) => {
                return Err(Error::corruption(format!(
                    "operation which previously succeeded failed during log replay: \
                     op {} of write {}: {}",
                    op_idx,
                    tx.op_id(),
                    message
                )));
            }
            Some(_) => {}
            None => {
                return Err(Error::illegal_state(format!(
                    "op {} of write {} has no result after apply",
                    op_idx,
                    tx.op_id()
                )));
            }
        }
    }
    Ok(())
}

/// Filter a single insert, marking it failed if its row was already
/// flushed.
fn filter_insert(
    tablet: &Tablet,
    tx: &mut WriteTransactionState,
    op_idx: usize,
    op_result: &OperationResult,
) -> Result<()> {
    let stores = op_result.mutated_stores();
    let target = match stores {
        [target @ MemStoreTarget::Mrs { .. }] => target,
        _ => {
            return Err(Error::corruption(format!(
                "insert operation result must have a single memrowset target: {:?}",
                op_result
            )));
        }
    };

    if was_store_already_flushed(tablet.metadata(), target) {
        debug!(
            op_id = %tx.op_id(),
            flushed_to = %target,
            last_durable_mrs_id = tablet.metadata().last_durable_mrs_id(),
            "skipping insert that was already flushed"
        );
        tx.row_ops_mut()[op_idx].set_failed("row to insert was already flushed");
    }
    Ok(())
}

/// Filter a single update or delete, marking it failed if the mutation
/// was already flushed everywhere it landed.
fn filter_mutate(
    tablet: &Tablet,
    tx: &mut WriteTransactionState,
    op_idx: usize,
    op_result: &OperationResult,
) -> Result<()> {
    let stores = op_result.mutated_stores();
    if stores.is_empty() || stores.len() > 2 {
        return Err(Error::corruption(format!(
            "mutations must have one or two mutated stores: {:?}",
            op_result
        )));
    }

    // The mutation may have been duplicated into two stores by a
    // concurrent compaction; it is skippable only if every copy is
    // already durable.
    let mut num_unflushed_stores = 0;
    for target in stores {
        if !was_store_already_flushed(tablet.metadata(), target) {
            num_unflushed_stores += 1;
        } else {
            debug!(
                op_id = %tx.op_id(),
                target = %target,
                "skipping mutation target that was already flushed"
            );
        }
    }

    if num_unflushed_stores == 0 {
        tx.row_ops_mut()[op_idx].set_failed("update was already flushed");
        return Ok(());
    }

    if num_unflushed_stores == 2 {
        // A crash between a compaction's data flush and its metadata
        // update can leave both duplicated targets looking unflushed.
        // Re-applying the edit is safe; it lands in the surviving store.
        warn!(
            op_id = %tx.op_id(),
            "mutation unflushed in both duplicated targets, re-applying"
        );
    }

    Ok(())
}
