//! The replay state machine and segment pipeline.
//!
//! Entries are fed through one at a time. Replicates must arrive in
//! sequence and are held pending until their commit (or abort) record
//! shows up, possibly segments later; each matched pair is replayed
//! into the tablet and the new log. Replicates still pending at end of
//! stream were in-flight at crash time and are handed back to the
//! consensus layer.

use std::collections::btree_map::Entry as BTreeEntry;
use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::consensus::{ConsensusMetadata, OpId};
use crate::log::{
    CommitMsg, Log, LogEntry, LogReader, Operation, OperationType, ReplicateMsg, ReplicateOp,
};
use crate::metrics::MetricContext;
use crate::tablet::{RowArena, Tablet};
use crate::{Error, Result};

use super::filter::{filter_and_apply_operations, was_store_already_flushed};
use super::TabletStatusListener;

/// Cursor over the replayed entry stream.
#[derive(Debug)]
pub(crate) struct ReplayState {
    /// The last replicate message's id.
    prev_op_id: OpId,
    /// The last operation known to be committed. All other operations
    /// with lower ids are also committed.
    committed_op_id: OpId,
    /// Replicate messages whose commit/abort record has not yet been
    /// seen, keyed by op id.
    pending_replicates: BTreeMap<OpId, ReplicateMsg>,
}

impl ReplayState {
    pub(crate) fn new() -> Self {
        Self {
            prev_op_id: OpId::MIN,
            committed_op_id: OpId::MIN,
            pending_replicates: BTreeMap::new(),
        }
    }

    /// Return true if `b` is allowed to immediately follow `a` in the log.
    fn valid_sequence(a: OpId, b: OpId) -> bool {
        if a.is_min() {
            // Not initialized, can start with any opid.
            return true;
        }

        // Within the same term, each entry should have an index exactly
        // one higher than the previous.
        if b.term == a.term && b.index != a.index + 1 {
            return false;
        }

        // If the terms don't match, the new term should be higher.
        if b.term < a.term {
            return false;
        }
        true
    }

    /// Check that a replicate's id follows the previous one, advancing
    /// the cursor on success.
    fn check_sequential_replicate_id(&mut self, msg: &ReplicateMsg) -> Result<()> {
        if !Self::valid_sequence(self.prev_op_id, msg.op_id) {
            return Err(Error::corruption(format!(
                "Unexpected opid following opid {}. Operation: {} REPLICATE ({})",
                self.prev_op_id,
                msg.op_id,
                msg.op.op_type()
            )));
        }
        self.prev_op_id = msg.op_id;
        Ok(())
    }

    /// Ratchet the committed-op watermark forward.
    fn update_committed_op_id(&mut self, id: OpId) {
        if id > self.committed_op_id {
            self.committed_op_id = id;
        }
    }

    pub(crate) fn prev_op_id(&self) -> OpId {
        self.prev_op_id
    }

    pub(crate) fn committed_op_id(&self) -> OpId {
        self.committed_op_id
    }

    /// Consume the state, yielding the replicates that never saw a
    /// commit, in op-id order.
    pub(crate) fn into_orphaned_replicates(self) -> Vec<ReplicateMsg> {
        self.pending_replicates.into_values().collect()
    }
}

/// Drives the tablet's quarantined segments through the state machine,
/// rebuilding the tablet's soft state and a fresh log.
pub(crate) struct LogReplayer<'a> {
    tablet: &'a Tablet,
    log: &'a mut Log,
    cmeta: &'a mut ConsensusMetadata,
    reader: &'a LogReader,
    metrics: &'a MetricContext,
    listener: &'a TabletStatusListener,
    arena: RowArena,
    state: ReplayState,
}

impl<'a> LogReplayer<'a> {
    pub(crate) fn new(
        tablet: &'a Tablet,
        log: &'a mut Log,
        cmeta: &'a mut ConsensusMetadata,
        reader: &'a LogReader,
        metrics: &'a MetricContext,
        listener: &'a TabletStatusListener,
        arena: RowArena,
    ) -> Self {
        Self {
            tablet,
            log,
            cmeta,
            reader,
            metrics,
            listener,
            arena,
            state: ReplayState::new(),
        }
    }

    /// Play every discovered segment, in log-sequence order.
    pub(crate) fn play_segments(&mut self) -> Result<()> {
        let tablet_id = self.tablet.tablet_id().to_string();
        let segments = self.reader.segments().to_vec();
        let num_segments = self.reader.num_segments();

        for (segment_count, segment) in segments.iter().enumerate() {
            let read = segment.read_entries();
            let entries_read = read.entries.len();

            for (entry_idx, entry) in read.entries.into_iter().enumerate() {
                // Entries share their payload bytes, so the backup for
                // diagnostics is cheap.
                let entry_backup = entry.clone();
                self.handle_entry(entry).map_err(|e| {
                    e.prepend(format!(
                        "error playing entry {} of segment {} of tablet {}. \
                         Segment path: {}. Entry: {}",
                        entry_idx,
                        segment.seqno(),
                        tablet_id,
                        segment.path().display(),
                        entry_backup.debug_string()
                    ))
                })?;
                self.metrics.bootstrap().entries_replayed.inc();
            }

            // A failed segment read still replays the decoded prefix
            // above, then fails the bootstrap naming where it stopped.
            if let Some(read_err) = read.error {
                return Err(Error::corruption(format!(
                    "error reading log segment of tablet {}: {} \
                     (read up to entry {} of segment {}, in path {})",
                    tablet_id,
                    read_err,
                    entries_read,
                    segment.seqno(),
                    segment.path().display()
                )));
            }

            self.metrics.bootstrap().segments_replayed.inc();
            self.listener.status_message(format!(
                "Bootstrap replayed {}/{} log segments.",
                segment_count + 1,
                num_segments
            ));
        }

        Ok(())
    }

    /// Consume the replayer, yielding the terminal replay state.
    pub(crate) fn finish(self) -> ReplayState {
        self.state
    }

    fn handle_entry(&mut self, entry: LogEntry) -> Result<()> {
        match entry {
            LogEntry::Operation(Operation::Replicate(msg)) => self.handle_replicate_message(msg),
            LogEntry::Operation(Operation::Commit(msg)) => self.handle_commit_message(msg),
            LogEntry::FlushMarker => {
                Err(Error::corruption("unexpected log entry type: FLUSH_MARKER"))
            }
        }
    }

    fn handle_replicate_message(&mut self, msg: ReplicateMsg) -> Result<()> {
        self.state.check_sequential_replicate_id(&msg)?;

        // Append the replicate message to the new log as is.
        let entry = LogEntry::Operation(Operation::Replicate(msg));
        self.log.append(&entry)?;
        let LogEntry::Operation(Operation::Replicate(msg)) = entry else {
            unreachable!();
        };

        match self.state.pending_replicates.entry(msg.op_id) {
            BTreeEntry::Occupied(existing) => Err(Error::corruption(format!(
                "found previous entry with the same id: {}",
                LogEntry::Operation(Operation::Replicate(existing.get().clone())).debug_string()
            ))),
            BTreeEntry::Vacant(slot) => {
                slot.insert(msg);
                Ok(())
            }
        }
    }

    fn handle_commit_message(&mut self, commit: CommitMsg) -> Result<()> {
        // TODO: on a term switch, the first commit in any term should
        // discard any pending replicates from the previous term.

        self.state.update_committed_op_id(commit.committed_op_id);

        // Match the commit/abort record up with the replicate it
        // applies to.
        match self.state.pending_replicates.remove(&commit.committed_op_id) {
            Some(replicate) => self.handle_entry_pair(replicate, commit),
            None => self.handle_orphan_commit(commit),
        }
    }

    /// A commit with no pending replicate is legal only if the
    /// replicate lived in a segment that was GC'd after its effects
    /// were flushed; otherwise data has been lost.
    fn handle_orphan_commit(&mut self, commit: CommitMsg) -> Result<()> {
        for target in commit.result.mutated_stores() {
            if !was_store_already_flushed(self.tablet.metadata(), target) {
                self.dump_replayed_entries();
                return Err(Error::corruption(format!(
                    "orphan commit for op {} has a mutated store ({}) that was NOT \
                     already flushed",
                    commit.committed_op_id, target
                )));
            }
        }
        debug!(committed_op_id = %commit.committed_op_id, "ignoring orphan commit");
        Ok(())
    }

    /// Log every entry of every segment, for diagnosing an orphan
    /// commit that references unflushed state.
    fn dump_replayed_entries(&self) {
        info!("printing replayed entries:");
        for segment in self.reader.segments() {
            let read = segment.read_entries();
            for entry in &read.entries {
                info!(segment = segment.seqno(), entry = %entry.debug_string());
            }
        }
    }

    fn handle_entry_pair(&mut self, replicate: ReplicateMsg, commit: CommitMsg) -> Result<()> {
        let op_id = replicate.op_id;

        match commit.op_type {
            OperationType::Abort => {
                // Aborted operations carry invalid timestamps, so the
                // clock must not be updated from them.
                debug!(%op_id, "skipping replicate message because it was originally aborted");
                return Ok(());
            }
            OperationType::Write => self
                .play_write_request(replicate, &commit)
                .map_err(|e| e.prepend(format!("failed to play write request for op {}", op_id)))?,
            OperationType::AlterSchema => self.play_alter_schema_request(replicate, &commit).map_err(
                |e| e.prepend(format!("failed to play alter schema request for op {}", op_id)),
            )?,
            OperationType::ChangeConfig => self.play_change_config_request(replicate, &commit).map_err(
                |e| e.prepend(format!("failed to play change config request for op {}", op_id)),
            )?,
        }

        // Advance the clock past the replayed commit.
        self.tablet.clock().update(commit.timestamp)
    }

    fn play_write_request(&mut self, replicate: ReplicateMsg, commit: &CommitMsg) -> Result<()> {
        let op_id = replicate.op_id;
        let ReplicateOp::Write(write) = replicate.op else {
            return Err(Error::corruption(format!(
                "commit of type WRITE for op {} does not match its replicate",
                op_id
            )));
        };

        let mut tx = self.tablet.start_transaction(op_id);

        if !write.row_ops.is_empty() {
            self.arena.reset();
            self.tablet
                .decode_write_operations(&write.schema, &write.row_ops, &mut self.arena, &mut tx)
                .map_err(|e| e.prepend("could not decode row operations"))?;
            self.tablet
                .acquire_row_locks(&mut tx)
                .map_err(|e| e.prepend("failed to acquire row locks"))?;

            filter_and_apply_operations(self.tablet, &mut tx, &commit.result, self.metrics)?;
        }

        // Append the commit to the new log, but with the freshly
        // materialized result so the log reflects the replayed outcomes.
        let new_commit = CommitMsg {
            op_type: commit.op_type,
            committed_op_id: commit.committed_op_id,
            timestamp: commit.timestamp,
            result: tx.take_result()?,
        };
        self.log.append(&LogEntry::commit(new_commit))?;
        Ok(())
    }

    fn play_alter_schema_request(
        &mut self,
        replicate: ReplicateMsg,
        commit: &CommitMsg,
    ) -> Result<()> {
        let op_id = replicate.op_id;
        let ReplicateOp::AlterSchema(alter) = replicate.op else {
            return Err(Error::corruption(format!(
                "commit of type ALTER_SCHEMA for op {} does not match its replicate",
                op_id
            )));
        };

        self.tablet.create_prepared_alter_schema(&alter.schema)?;
        self.tablet
            .alter_schema(alter.schema)
            .map_err(|e| e.prepend("failed to alter schema"))?;

        self.log.append(&LogEntry::commit(commit.clone()))?;
        Ok(())
    }

    fn play_change_config_request(
        &mut self,
        replicate: ReplicateMsg,
        commit: &CommitMsg,
    ) -> Result<()> {
        let op_id = replicate.op_id;
        let ReplicateOp::ChangeConfig(change) = replicate.op else {
            return Err(Error::corruption(format!(
                "commit of type CHANGE_CONFIG for op {} does not match its replicate",
                op_id
            )));
        };

        // A configuration only takes effect if its seqno is strictly
        // newer than the committed one. The metadata is flushed once at
        // the end of bootstrap, not per config change.
        let committed_seqno = self.cmeta.quorum().seqno;
        if change.new_config.seqno > committed_seqno {
            debug!(
                new_seqno = change.new_config.seqno,
                committed_seqno, "replay applying config change"
            );
            self.cmeta.set_quorum(change.new_config);
        } else {
            debug!(
                new_seqno = change.new_config.seqno,
                committed_seqno, "replay skipping config change no newer than committed"
            );
        }

        self.log.append(&LogEntry::commit(commit.clone()))?;
        Ok(())
    }
}
