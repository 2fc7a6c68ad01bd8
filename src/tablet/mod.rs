//! The tablet: a horizontally-partitioned replica of a table.
//!
//! Rows live in two kinds of store. Fresh inserts land in the
//! memrowset; once a memrowset is flushed its rows become a rowset, and
//! later updates or deletes of those rows are buffered in the rowset's
//! delta memstore. The tablet metadata records which stores have been
//! made durable.

mod arena;
mod memstore;
mod metadata;
mod schema;
mod txn;

pub use arena::RowArena;
pub use memstore::{DeltaMemStore, MemRowSet, MrsRow, RowChange};
pub use metadata::{RemoteBootstrapState, RowSetMetadata, TabletMetadata};
pub use schema::{ColumnSchema, ColumnType, Schema};
pub use txn::{LockManager, RowLock, RowOp, WriteTransactionState};

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use tracing::debug;

use crate::clock::Clock;
use crate::consensus::{OpId, OpIdAnchorRegistry};
use crate::log::{MemStoreTarget, OperationResult, RowOperation, RowOperationBatch};
use crate::{Error, Result};

/// A persisted rowset: base data plus a delta memstore buffering
/// mutations against it.
///
/// Base data normally comes from the rowset's on-disk blocks; block IO
/// lives outside this crate, so embedders load base rows when the
/// tablet is opened.
#[derive(Debug)]
pub struct RowSet {
    rs_id: u64,
    base: SkipMap<Bytes, Bytes>,
    dms: DeltaMemStore,
}

impl RowSet {
    fn new(meta: RowSetMetadata) -> Self {
        Self {
            rs_id: meta.rs_id,
            base: SkipMap::new(),
            // The live delta memstore follows the last flushed one.
            dms: DeltaMemStore::new(meta.last_durable_redo_dms_id + 1),
        }
    }

    /// The rowset id.
    pub fn rs_id(&self) -> u64 {
        self.rs_id
    }

    /// The rowset's live delta memstore.
    pub fn dms(&self) -> &DeltaMemStore {
        &self.dms
    }

    /// Load a base row.
    pub fn load_base_row(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.base.insert(key.into(), value.into());
    }

    /// Whether the base data contains a row key.
    pub fn base_contains(&self, key: &Bytes) -> bool {
        self.base.contains_key(key)
    }

    /// Number of base rows.
    pub fn num_base_rows(&self) -> usize {
        self.base.len()
    }
}

/// A tablet replica.
#[derive(Debug)]
pub struct Tablet {
    metadata: Arc<TabletMetadata>,
    clock: Arc<Clock>,
    anchor_registry: Arc<OpIdAnchorRegistry>,
    lock_manager: Arc<LockManager>,
    mrs: Option<MemRowSet>,
    rowsets: Vec<RowSet>,
}

impl Tablet {
    /// Create a tablet over its metadata. The tablet is unusable until
    /// `open` is called.
    pub fn new(
        metadata: Arc<TabletMetadata>,
        clock: Arc<Clock>,
        anchor_registry: Arc<OpIdAnchorRegistry>,
    ) -> Self {
        Self {
            metadata,
            clock,
            anchor_registry,
            lock_manager: LockManager::new(),
            mrs: None,
            rowsets: Vec::new(),
        }
    }

    /// Open the tablet: set up the live memrowset and one rowset per
    /// entry in the metadata.
    pub fn open(&mut self) -> Result<()> {
        if self.mrs.is_some() {
            return Err(Error::illegal_state("tablet is already open"));
        }

        // The live memrowset follows the last flushed one.
        self.mrs = Some(MemRowSet::new(self.metadata.last_durable_mrs_id() + 1));
        self.rowsets = self
            .metadata
            .rowsets()
            .into_iter()
            .map(RowSet::new)
            .collect();
        Ok(())
    }

    fn mrs(&self) -> Result<&MemRowSet> {
        self.mrs
            .as_ref()
            .ok_or_else(|| Error::illegal_state("tablet is not open"))
    }

    /// The tablet id.
    pub fn tablet_id(&self) -> &str {
        self.metadata.tablet_id()
    }

    /// The tablet metadata.
    pub fn metadata(&self) -> &Arc<TabletMetadata> {
        &self.metadata
    }

    /// The clock this tablet assigns timestamps from.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// The current schema.
    pub fn schema(&self) -> Schema {
        self.metadata.schema()
    }

    /// Number of persisted rowsets.
    pub fn num_rowsets(&self) -> usize {
        self.rowsets.len()
    }

    /// The live memrowset. Fails if the tablet is not open.
    pub fn memrowset(&self) -> Result<&MemRowSet> {
        self.mrs()
    }

    /// A rowset by id.
    pub fn rowset(&self, rs_id: u64) -> Option<&RowSet> {
        self.rowsets.iter().find(|rs| rs.rs_id == rs_id)
    }

    /// All rowsets.
    pub fn rowsets(&self) -> &[RowSet] {
        &self.rowsets
    }

    /// Begin a write transaction for the operation `op_id`.
    pub fn start_transaction(&self, op_id: OpId) -> WriteTransactionState {
        WriteTransactionState::new(op_id, self.clock.now())
    }

    /// Decode the row operations of a write request into `tx`.
    ///
    /// Keys and values are copied into `arena` so the decoded ops share
    /// a handful of block allocations.
    pub fn decode_write_operations(
        &self,
        schema: &Schema,
        row_ops: &RowOperationBatch,
        arena: &mut RowArena,
        tx: &mut WriteTransactionState,
    ) -> Result<()> {
        if schema.columns.is_empty() {
            return Err(Error::corruption("write request schema has no columns"));
        }

        let mut decoded = Vec::with_capacity(row_ops.len());
        for op in &row_ops.ops {
            let op = match op {
                RowOperation::Insert { key, value } => RowOperation::Insert {
                    key: arena.dup(key),
                    value: arena.dup(value),
                },
                RowOperation::Update { key, value } => RowOperation::Update {
                    key: arena.dup(key),
                    value: arena.dup(value),
                },
                RowOperation::Delete { key } => RowOperation::Delete {
                    key: arena.dup(key),
                },
            };
            decoded.push(RowOp::new(op));
        }
        tx.set_row_ops(decoded);
        Ok(())
    }

    /// Acquire a row lock for every distinct key in the transaction.
    pub fn acquire_row_locks(&self, tx: &mut WriteTransactionState) -> Result<()> {
        let mut keys: Vec<Bytes> = tx
            .row_ops()
            .iter()
            .map(|row_op| row_op.op().key().clone())
            .collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let lock = self.lock_manager.lock_row(key)?;
            tx.add_lock(lock);
        }
        Ok(())
    }

    /// Apply the `idx`-th row operation of `tx` to the tablet.
    ///
    /// Always records an outcome on the op: a mutated-store result on
    /// success, a failure (already present, not found) otherwise. The
    /// first in-memory effect of a write anchors its op id against log
    /// GC.
    pub fn apply_row_operation(&self, tx: &mut WriteTransactionState, idx: usize) -> Result<()> {
        let mrs_id = self.mrs()?.id();
        let op = tx.row_ops()[idx].op().clone();

        let result = match op {
            RowOperation::Insert { key, value } => self.apply_insert(key, value, mrs_id)?,
            RowOperation::Update { key, value } => {
                self.apply_mutation(key, Some(value), mrs_id)?
            }
            RowOperation::Delete { key } => self.apply_mutation(key, None, mrs_id)?,
        };

        if !result.is_failed() && !tx.is_anchored() {
            self.anchor_registry.register(tx.op_id());
            tx.set_anchored();
        }

        tx.row_ops_mut()[idx].set_result(result);
        Ok(())
    }

    fn apply_insert(&self, key: Bytes, value: Bytes, mrs_id: u64) -> Result<OperationResult> {
        let mrs = self.mrs()?;
        if mrs.contains_live(&key) || self.rowsets.iter().any(|rs| rs.base_contains(&key)) {
            return Ok(OperationResult::failed(format!(
                "key {:?} already present",
                key
            )));
        }
        mrs.insert(key, value)?;
        Ok(OperationResult::applied(MemStoreTarget::Mrs { mrs_id }))
    }

    fn apply_mutation(
        &self,
        key: Bytes,
        value: Option<Bytes>,
        mrs_id: u64,
    ) -> Result<OperationResult> {
        let mrs = self.mrs()?;

        // Rows still in the memrowset are mutated in place.
        if mrs.contains_live(&key) {
            let _applied = match &value {
                Some(v) => mrs.mutate(&key, v.clone()),
                None => mrs.delete(&key),
            };
            debug_assert!(_applied);
            return Ok(OperationResult::applied(MemStoreTarget::Mrs { mrs_id }));
        }

        // Otherwise the row lives in a rowset's base data; buffer the
        // change in its delta memstore.
        if let Some(rs) = self.rowsets.iter().find(|rs| rs.base_contains(&key)) {
            let change = match value {
                Some(v) => RowChange::Update(v),
                None => RowChange::Delete,
            };
            rs.dms.upsert(key, change);
            return Ok(OperationResult::applied(MemStoreTarget::Drs {
                rs_id: rs.rs_id,
                dms_id: rs.dms.id(),
            }));
        }

        Ok(OperationResult::failed(format!("row {:?} not found", key)))
    }

    /// Validate a schema change before it is applied.
    pub fn create_prepared_alter_schema(&self, schema: &Schema) -> Result<()> {
        if schema.columns.is_empty() {
            return Err(Error::invalid_argument("new schema has no columns"));
        }
        Ok(())
    }

    /// Apply a schema change. A schema no newer than the current one is
    /// a no-op.
    pub fn alter_schema(&self, schema: Schema) -> Result<()> {
        let current = self.metadata.schema();
        if schema.version <= current.version {
            debug!(
                tablet_id = self.tablet_id(),
                current_version = current.version,
                new_version = schema.version,
                "ignoring schema no newer than the current one"
            );
            return Ok(());
        }
        self.metadata.set_schema(schema);
        Ok(())
    }
}
