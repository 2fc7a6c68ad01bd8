//! Wire format for log entries and the operations they carry.
//!
//! A log entry is a typed envelope. Operation entries carry exactly one
//! of two payloads: a replicate message (an operation proposed by
//! consensus, with an op id) or a commit message (no op id of its own;
//! it references the op id it applies to and records the per-row
//! outcome).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::clock::Timestamp;
use crate::consensus::{OpId, QuorumConfig};
use crate::tablet::Schema;
use crate::util::coding::{
    decode_length_prefixed, decode_varint64, encode_length_prefixed, encode_varint64,
};
use crate::{Error, Result};

/// Log entry envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// A replicated operation or its commit record.
    Operation = 1,
    /// Reserved marker written by flush bookkeeping; not replayed.
    FlushMarker = 2,
}

impl EntryType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(EntryType::Operation),
            2 => Some(EntryType::FlushMarker),
            _ => None,
        }
    }
}

/// Discriminator for the operation a commit record applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationType {
    /// A row write (inserts, updates, deletes).
    Write = 1,
    /// A schema change.
    AlterSchema = 2,
    /// A quorum configuration change.
    ChangeConfig = 3,
    /// The operation was aborted; its commit carries no valid timestamp.
    Abort = 4,
}

impl OperationType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(OperationType::Write),
            2 => Some(OperationType::AlterSchema),
            3 => Some(OperationType::ChangeConfig),
            4 => Some(OperationType::Abort),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::Write => "WRITE",
            OperationType::AlterSchema => "ALTER_SCHEMA",
            OperationType::ChangeConfig => "CHANGE_CONFIG",
            OperationType::Abort => "ABORT",
        };
        f.write_str(name)
    }
}

/// A single row operation inside a write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOperation {
    /// Insert a new row.
    Insert {
        /// Encoded row key.
        key: Bytes,
        /// Encoded row payload.
        value: Bytes,
    },
    /// Update an existing row.
    Update {
        /// Encoded row key.
        key: Bytes,
        /// Encoded change list.
        value: Bytes,
    },
    /// Delete an existing row.
    Delete {
        /// Encoded row key.
        key: Bytes,
    },
}

impl RowOperation {
    /// The row key this operation targets.
    pub fn key(&self) -> &Bytes {
        match self {
            RowOperation::Insert { key, .. }
            | RowOperation::Update { key, .. }
            | RowOperation::Delete { key } => key,
        }
    }

    /// True for updates and deletes.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RowOperation::Insert { .. })
    }

    fn kind_byte(&self) -> u8 {
        match self {
            RowOperation::Insert { .. } => 1,
            RowOperation::Update { .. } => 2,
            RowOperation::Delete { .. } => 3,
        }
    }
}

/// An ordered batch of row operations, as shipped inside a write request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowOperationBatch {
    /// The operations, in client order.
    pub ops: Vec<RowOperation>,
}

impl RowOperationBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an insert.
    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.ops.push(RowOperation::Insert {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Add an update.
    pub fn update(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.ops.push(RowOperation::Update {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Add a delete.
    pub fn delete(&mut self, key: impl Into<Bytes>) {
        self.ops.push(RowOperation::Delete { key: key.into() });
    }

    /// Number of operations in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn encode_to(&self, buf: &mut BytesMut) {
        encode_varint64(buf, self.ops.len() as u64);
        for op in &self.ops {
            buf.put_u8(op.kind_byte());
            match op {
                RowOperation::Insert { key, value } | RowOperation::Update { key, value } => {
                    encode_length_prefixed(buf, key);
                    encode_length_prefixed(buf, value);
                }
                RowOperation::Delete { key } => {
                    encode_length_prefixed(buf, key);
                }
            }
        }
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self> {
        let count = decode_varint64(buf)
            .ok_or_else(|| Error::corruption("row op count truncated"))?;
        let mut batch = RowOperationBatch::new();
        for _ in 0..count {
            if buf.is_empty() {
                return Err(Error::corruption("row op kind truncated"));
            }
            let kind = buf.get_u8();
            let key = decode_length_prefixed(buf)
                .ok_or_else(|| Error::corruption("row op key truncated"))?;
            match kind {
                1 | 2 => {
                    let value = decode_length_prefixed(buf)
                        .ok_or_else(|| Error::corruption("row op value truncated"))?;
                    if kind == 1 {
                        batch.ops.push(RowOperation::Insert { key, value });
                    } else {
                        batch.ops.push(RowOperation::Update { key, value });
                    }
                }
                3 => batch.ops.push(RowOperation::Delete { key }),
                k => return Err(Error::corruption(format!("unknown row op kind: {}", k))),
            }
        }
        Ok(batch)
    }
}

/// A client write request: the schema rows were encoded with, plus the
/// row operations themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Schema the row operations were encoded against.
    pub schema: Schema,
    /// The row operations.
    pub row_ops: RowOperationBatch,
}

/// A schema-change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterSchemaRequest {
    /// The new schema, including its bumped version.
    pub schema: Schema,
}

/// A quorum-configuration-change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeConfigRequest {
    /// The proposed configuration.
    pub new_config: QuorumConfig,
}

/// The operation variants a replicate message can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicateOp {
    /// A row write.
    Write(WriteRequest),
    /// A schema change.
    AlterSchema(AlterSchemaRequest),
    /// A config change.
    ChangeConfig(ChangeConfigRequest),
}

impl ReplicateOp {
    /// The operation type discriminator matching this variant.
    pub fn op_type(&self) -> OperationType {
        match self {
            ReplicateOp::Write(_) => OperationType::Write,
            ReplicateOp::AlterSchema(_) => OperationType::AlterSchema,
            ReplicateOp::ChangeConfig(_) => OperationType::ChangeConfig,
        }
    }
}

/// An operation proposed by consensus, identified by an op id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateMsg {
    /// The operation's id.
    pub op_id: OpId,
    /// The operation itself.
    pub op: ReplicateOp,
}

/// Where a row-level effect landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemStoreTarget {
    /// The insert went to a memrowset.
    Mrs {
        /// Id of the memrowset.
        mrs_id: u64,
    },
    /// The mutation went to a rowset's delta memstore.
    Drs {
        /// Id of the rowset.
        rs_id: u64,
        /// Id of the rowset's delta memstore.
        dms_id: u64,
    },
}

impl std::fmt::Display for MemStoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemStoreTarget::Mrs { mrs_id } => write!(f, "mrs_id: {}", mrs_id),
            MemStoreTarget::Drs { rs_id, dms_id } => {
                write!(f, "rs_id: {} dms_id: {}", rs_id, dms_id)
            }
        }
    }
}

/// Outcome of a single row operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// The operation failed; the message describes why.
    Failed {
        /// Failure description.
        message: String,
    },
    /// The operation succeeded, mutating the listed stores.
    Applied {
        /// Stores the effect landed in (one, or two when duplicated by
        /// a concurrent compaction).
        mutated_stores: Vec<MemStoreTarget>,
    },
}

impl OperationResult {
    /// Convenience constructor for a failure.
    pub fn failed(message: impl Into<String>) -> Self {
        OperationResult::Failed {
            message: message.into(),
        }
    }

    /// Convenience constructor for a single-store success.
    pub fn applied(target: MemStoreTarget) -> Self {
        OperationResult::Applied {
            mutated_stores: vec![target],
        }
    }

    /// Check whether this is a failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, OperationResult::Failed { .. })
    }

    /// The mutated stores, empty for failures.
    pub fn mutated_stores(&self) -> &[MemStoreTarget] {
        match self {
            OperationResult::Failed { .. } => &[],
            OperationResult::Applied { mutated_stores } => mutated_stores,
        }
    }
}

/// Per-row outcomes of a write, in the order the rows appeared in the
/// original request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxResult {
    /// One result per row operation.
    pub ops: Vec<OperationResult>,
}

impl TxResult {
    /// Create an empty result.
    pub fn new(ops: Vec<OperationResult>) -> Self {
        Self { ops }
    }

    /// Iterate over every mutated store across all rows.
    pub fn mutated_stores(&self) -> impl Iterator<Item = &MemStoreTarget> {
        self.ops.iter().flat_map(|op| op.mutated_stores().iter())
    }
}

/// A commit (or abort) record for an earlier replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMsg {
    /// Type of the operation this commit applies to.
    pub op_type: OperationType,
    /// The op id of the replicate this commit applies to.
    pub committed_op_id: OpId,
    /// Timestamp the operation was assigned. Invalid for aborts.
    pub timestamp: Timestamp,
    /// Per-row outcomes. Empty for non-write operations.
    pub result: TxResult,
}

/// Payload of an operation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A replicate message.
    Replicate(ReplicateMsg),
    /// A commit message.
    Commit(CommitMsg),
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// A replicated operation or its commit record.
    Operation(Operation),
    /// Reserved flush bookkeeping marker.
    FlushMarker,
}

impl LogEntry {
    /// Construct a replicate entry.
    pub fn replicate(op_id: OpId, op: ReplicateOp) -> Self {
        LogEntry::Operation(Operation::Replicate(ReplicateMsg { op_id, op }))
    }

    /// Construct a commit entry.
    pub fn commit(msg: CommitMsg) -> Self {
        LogEntry::Operation(Operation::Commit(msg))
    }

    /// A short, truncated debug rendering for diagnostics.
    ///
    /// Bounded at 500 characters so a huge write request can't swamp an
    /// error message.
    pub fn debug_string(&self) -> String {
        let mut s = format!("{:?}", self);
        if s.len() > 500 {
            s.truncate(500);
            s.push_str("...");
        }
        s
    }

    /// Encode this entry to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        match self {
            LogEntry::FlushMarker => {
                buf.put_u8(EntryType::FlushMarker as u8);
            }
            LogEntry::Operation(op) => {
                buf.put_u8(EntryType::Operation as u8);
                match op {
                    Operation::Replicate(replicate) => {
                        buf.put_u8(1);
                        replicate.op_id.encode_to(&mut buf);
                        match &replicate.op {
                            ReplicateOp::Write(write) => {
                                buf.put_u8(OperationType::Write as u8);
                                write.schema.encode_to(&mut buf);
                                write.row_ops.encode_to(&mut buf);
                            }
                            ReplicateOp::AlterSchema(alter) => {
                                buf.put_u8(OperationType::AlterSchema as u8);
                                alter.schema.encode_to(&mut buf);
                            }
                            ReplicateOp::ChangeConfig(change) => {
                                buf.put_u8(OperationType::ChangeConfig as u8);
                                encode_length_prefixed(&mut buf, &change.new_config.encode());
                            }
                        }
                    }
                    Operation::Commit(commit) => {
                        buf.put_u8(2);
                        buf.put_u8(commit.op_type as u8);
                        commit.committed_op_id.encode_to(&mut buf);
                        encode_varint64(&mut buf, commit.timestamp.0);
                        encode_tx_result(&mut buf, &commit.result);
                    }
                }
            }
        }
        buf.freeze()
    }

    /// Decode an entry from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.is_empty() {
            return Err(Error::corruption("empty log entry"));
        }
        let entry_type = buf.get_u8();
        let entry_type = EntryType::from_byte(entry_type)
            .ok_or_else(|| Error::corruption(format!("unknown log entry type: {}", entry_type)))?;

        match entry_type {
            EntryType::FlushMarker => Ok(LogEntry::FlushMarker),
            EntryType::Operation => {
                if buf.is_empty() {
                    return Err(Error::corruption("operation entry truncated"));
                }
                match buf.get_u8() {
                    1 => {
                        let op_id = OpId::decode_from(&mut buf)
                            .ok_or_else(|| Error::corruption("replicate op id truncated"))?;
                        if buf.is_empty() {
                            return Err(Error::corruption("replicate op type truncated"));
                        }
                        let op_type_byte = buf.get_u8();
                        let op = match OperationType::from_byte(op_type_byte) {
                            Some(OperationType::Write) => {
                                let schema = Schema::decode_from(&mut buf)?;
                                let row_ops = RowOperationBatch::decode_from(&mut buf)?;
                                ReplicateOp::Write(WriteRequest { schema, row_ops })
                            }
                            Some(OperationType::AlterSchema) => {
                                let schema = Schema::decode_from(&mut buf)?;
                                ReplicateOp::AlterSchema(AlterSchemaRequest { schema })
                            }
                            Some(OperationType::ChangeConfig) => {
                                let raw = decode_length_prefixed(&mut buf).ok_or_else(|| {
                                    Error::corruption("change config payload truncated")
                                })?;
                                ReplicateOp::ChangeConfig(ChangeConfigRequest {
                                    new_config: QuorumConfig::decode(&raw)?,
                                })
                            }
                            _ => {
                                return Err(Error::corruption(format!(
                                    "unknown replicate op type: {}",
                                    op_type_byte
                                )));
                            }
                        };
                        Ok(LogEntry::Operation(Operation::Replicate(ReplicateMsg {
                            op_id,
                            op,
                        })))
                    }
                    2 => {
                        if buf.is_empty() {
                            return Err(Error::corruption("commit op type truncated"));
                        }
                        let op_type_byte = buf.get_u8();
                        let op_type = OperationType::from_byte(op_type_byte).ok_or_else(|| {
                            Error::corruption(format!("unknown commit op type: {}", op_type_byte))
                        })?;
                        let committed_op_id = OpId::decode_from(&mut buf)
                            .ok_or_else(|| Error::corruption("commit op id truncated"))?;
                        let timestamp = decode_varint64(&mut buf)
                            .ok_or_else(|| Error::corruption("commit timestamp truncated"))?;
                        let result = decode_tx_result(&mut buf)?;
                        Ok(LogEntry::Operation(Operation::Commit(CommitMsg {
                            op_type,
                            committed_op_id,
                            timestamp: Timestamp(timestamp),
                            result,
                        })))
                    }
                    k => Err(Error::corruption(format!(
                        "unknown operation payload kind: {}",
                        k
                    ))),
                }
            }
        }
    }
}

fn encode_tx_result(buf: &mut BytesMut, result: &TxResult) {
    encode_varint64(buf, result.ops.len() as u64);
    for op in &result.ops {
        match op {
            OperationResult::Failed { message } => {
                buf.put_u8(1);
                encode_length_prefixed(buf, message.as_bytes());
            }
            OperationResult::Applied { mutated_stores } => {
                buf.put_u8(2);
                buf.put_u8(mutated_stores.len() as u8);
                for target in mutated_stores {
                    match target {
                        MemStoreTarget::Mrs { mrs_id } => {
                            buf.put_u8(1);
                            encode_varint64(buf, *mrs_id);
                        }
                        MemStoreTarget::Drs { rs_id, dms_id } => {
                            buf.put_u8(2);
                            encode_varint64(buf, *rs_id);
                            encode_varint64(buf, *dms_id);
                        }
                    }
                }
            }
        }
    }
}

fn decode_tx_result(buf: &mut &[u8]) -> Result<TxResult> {
    let count = decode_varint64(buf)
        .ok_or_else(|| Error::corruption("result op count truncated"))?;
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.is_empty() {
            return Err(Error::corruption("result op flag truncated"));
        }
        match buf.get_u8() {
            1 => {
                let message = decode_length_prefixed(buf)
                    .ok_or_else(|| Error::corruption("failure message truncated"))?;
                let message = String::from_utf8(message.to_vec())
                    .map_err(|_| Error::corruption("failure message is not utf-8"))?;
                ops.push(OperationResult::Failed { message });
            }
            2 => {
                if buf.is_empty() {
                    return Err(Error::corruption("mutated store count truncated"));
                }
                let ntargets = buf.get_u8();
                let mut mutated_stores = Vec::with_capacity(ntargets as usize);
                for _ in 0..ntargets {
                    if buf.is_empty() {
                        return Err(Error::corruption("mutated store kind truncated"));
                    }
                    match buf.get_u8() {
                        1 => {
                            let mrs_id = decode_varint64(buf)
                                .ok_or_else(|| Error::corruption("mrs id truncated"))?;
                            mutated_stores.push(MemStoreTarget::Mrs { mrs_id });
                        }
                        2 => {
                            let rs_id = decode_varint64(buf)
                                .ok_or_else(|| Error::corruption("rs id truncated"))?;
                            let dms_id = decode_varint64(buf)
                                .ok_or_else(|| Error::corruption("dms id truncated"))?;
                            mutated_stores.push(MemStoreTarget::Drs { rs_id, dms_id });
                        }
                        k => {
                            return Err(Error::corruption(format!(
                                "unknown mutated store kind: {}",
                                k
                            )));
                        }
                    }
                }
                ops.push(OperationResult::Applied { mutated_stores });
            }
            f => return Err(Error::corruption(format!("unknown result op flag: {}", f))),
        }
    }
    Ok(TxResult { ops })
}
