//! End-to-end bootstrap scenarios: quarantine a WAL, replay it, and
//! check the rebuilt tablet, the new log, and the consensus handoff.

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use tabletdb::{
    bootstrap_tablet, AlterSchemaRequest, BootstrappedTablet, ChangeConfigRequest, Clock,
    CommitMsg, ConsensusMetadata, Error, FsManager, Log, LogEntry, LogReader, MemStoreTarget,
    MetricContext, OpId, Operation, OperationResult, OperationType, Options, QuorumConfig,
    ReplicateOp, RowOperationBatch, RowSetMetadata, Schema, TabletMetadata, TabletStatusListener,
    Timestamp, TxResult, WriteRequest,
};

const TABLET_ID: &str = "test-tablet";

struct Harness {
    _dir: TempDir,
    fs: FsManager,
    meta: Arc<TabletMetadata>,
    clock: Arc<Clock>,
    metrics: MetricContext,
    listener: Arc<TabletStatusListener>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let meta = Arc::new(
            TabletMetadata::create(&fs, TABLET_ID, "users", Schema::key_value(1)).unwrap(),
        );
        ConsensusMetadata::create(&fs, TABLET_ID, QuorumConfig::new(1, vec!["peer-a".into()]))
            .unwrap();

        let listener = Arc::new(TabletStatusListener::new(Arc::clone(&meta)));
        Self {
            _dir: dir,
            fs,
            meta,
            clock: Clock::new(),
            metrics: MetricContext::new(),
            listener,
        }
    }

    /// Write one WAL segment holding `entries` into the live WAL dir.
    fn write_segment(&self, entries: &[LogEntry]) {
        let mut log = Log::open(&Default::default(), &self.fs, TABLET_ID).unwrap();
        for entry in entries {
            log.append(entry).unwrap();
        }
        log.close().unwrap();
    }

    fn bootstrap(&self) -> tabletdb::Result<BootstrappedTablet> {
        bootstrap_tablet(
            &Options::default(),
            Arc::clone(&self.meta),
            Arc::clone(&self.clock),
            self.metrics.clone(),
            Arc::clone(&self.listener),
        )
    }

    /// Read back the entries of the rebuilt log by quarantining the
    /// live WAL dir and pointing a reader at it.
    fn read_new_log(&self) -> Vec<LogEntry> {
        self.fs
            .rename(
                self.fs.tablet_wal_dir(TABLET_ID),
                self.fs.tablet_wal_recovery_dir(TABLET_ID),
            )
            .unwrap();
        let reader = LogReader::open_from_recovery_dir(&self.fs, TABLET_ID).unwrap();
        let mut entries = Vec::new();
        for segment in reader.segments() {
            let read = segment.read_entries();
            assert!(read.error.is_none(), "new log is corrupt: {:?}", read.error);
            entries.extend(read.entries);
        }
        entries
    }
}

fn insert_replicate(term: u64, index: u64, key: &str, value: &str) -> LogEntry {
    let mut row_ops = RowOperationBatch::new();
    row_ops.insert(
        Bytes::copy_from_slice(key.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes()),
    );
    LogEntry::replicate(
        OpId::new(term, index),
        ReplicateOp::Write(WriteRequest {
            schema: Schema::key_value(1),
            row_ops,
        }),
    )
}

fn update_replicate(term: u64, index: u64, key: &str, value: &str) -> LogEntry {
    let mut row_ops = RowOperationBatch::new();
    row_ops.update(
        Bytes::copy_from_slice(key.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes()),
    );
    LogEntry::replicate(
        OpId::new(term, index),
        ReplicateOp::Write(WriteRequest {
            schema: Schema::key_value(1),
            row_ops,
        }),
    )
}

fn write_commit(term: u64, index: u64, targets: Vec<MemStoreTarget>, ts: u64) -> LogEntry {
    LogEntry::commit(CommitMsg {
        op_type: OperationType::Write,
        committed_op_id: OpId::new(term, index),
        timestamp: Timestamp(ts),
        result: TxResult::new(vec![OperationResult::Applied {
            mutated_stores: targets,
        }]),
    })
}

fn commit_msg(entry: &LogEntry) -> &CommitMsg {
    match entry {
        LogEntry::Operation(Operation::Commit(commit)) => commit,
        other => panic!("expected a commit entry, got {:?}", other),
    }
}

#[test]
fn fresh_tablet_opens_empty_log() {
    let harness = Harness::new();

    let bootstrapped = harness.bootstrap().unwrap();

    assert_eq!(bootstrapped.info.last_id, OpId::MIN);
    assert_eq!(bootstrapped.info.last_committed_id, OpId::MIN);
    assert!(bootstrapped.info.orphaned_replicates.is_empty());
    assert_eq!(bootstrapped.tablet.num_rowsets(), 0);
    assert_eq!(
        harness.listener.last_status(),
        "No bootstrap required, opened a new log"
    );

    // A fresh log segment exists in the live WAL dir.
    bootstrapped.log.close().unwrap();
    assert_eq!(harness.read_new_log(), vec![]);
}

#[test]
fn clean_replay_applies_insert() {
    let harness = Harness::new();
    let replicate = insert_replicate(1, 1, "rowA", "v1");
    harness.write_segment(&[
        replicate.clone(),
        write_commit(1, 1, vec![MemStoreTarget::Mrs { mrs_id: 1 }], 42),
    ]);

    let bootstrapped = harness.bootstrap().unwrap();

    assert_eq!(bootstrapped.info.last_id, OpId::new(1, 1));
    assert_eq!(bootstrapped.info.last_committed_id, OpId::new(1, 1));
    assert!(bootstrapped.info.orphaned_replicates.is_empty());
    assert_eq!(harness.listener.last_status(), "Bootstrap complete.");

    // The row is back in the memrowset.
    let mrs = bootstrapped.tablet.memrowset().unwrap();
    assert_eq!(mrs.get(&Bytes::from("rowA")), Some(Bytes::from("v1")));

    // The clock advanced past the replayed commit.
    assert!(harness.clock.last() >= Timestamp(42));

    // The recovery dir is gone.
    assert!(!harness
        .fs
        .exists(harness.fs.tablet_wal_recovery_dir(TABLET_ID)));

    // The new log holds the replicate verbatim plus a commit with the
    // freshly computed result.
    bootstrapped.log.close().unwrap();
    let entries = harness.read_new_log();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], replicate);
    let commit = commit_msg(&entries[1]);
    assert_eq!(commit.committed_op_id, OpId::new(1, 1));
    assert_eq!(commit.op_type, OperationType::Write);
    assert_eq!(
        commit.result.ops,
        vec![OperationResult::applied(MemStoreTarget::Mrs { mrs_id: 1 })]
    );
}

#[test]
fn already_flushed_insert_is_skipped() {
    let harness = Harness::new();
    harness.meta.set_last_durable_mrs_id(5);
    harness.write_segment(&[
        insert_replicate(1, 1, "rowA", "v1"),
        write_commit(1, 1, vec![MemStoreTarget::Mrs { mrs_id: 1 }], 42),
    ]);

    let bootstrapped = harness.bootstrap().unwrap();

    // Not re-applied: its effects are already durable.
    assert!(!bootstrapped
        .tablet
        .memrowset()
        .unwrap()
        .contains_live(&Bytes::from("rowA")));
    assert_eq!(harness.metrics.bootstrap().ops_already_flushed.get(), 1);
    assert_eq!(harness.metrics.bootstrap().ops_applied.get(), 0);

    // The new log still carries the pair, with the skip recorded in the
    // fresh result.
    bootstrapped.log.close().unwrap();
    let entries = harness.read_new_log();
    assert_eq!(entries.len(), 2);
    let commit = commit_msg(&entries[1]);
    assert_eq!(commit.result.ops.len(), 1);
    assert!(commit.result.ops[0].is_failed());
}

#[test]
fn flushed_mutation_against_rowset_is_skipped() {
    let harness = Harness::new();
    harness.meta.add_rowset(RowSetMetadata {
        rs_id: 1,
        last_durable_redo_dms_id: 2,
    });
    harness.write_segment(&[
        update_replicate(1, 1, "rowA", "v2"),
        write_commit(1, 1, vec![MemStoreTarget::Drs { rs_id: 1, dms_id: 2 }], 7),
    ]);

    let bootstrapped = harness.bootstrap().unwrap();

    assert!(bootstrapped.tablet.rowset(1).unwrap().dms().is_empty());
    assert_eq!(harness.metrics.bootstrap().ops_already_flushed.get(), 1);
}

#[test]
fn orphaned_replicate_is_returned_to_consensus() {
    let harness = Harness::new();
    harness.write_segment(&[
        insert_replicate(1, 1, "rowA", "v1"),
        insert_replicate(1, 2, "rowB", "v2"),
        write_commit(1, 1, vec![MemStoreTarget::Mrs { mrs_id: 1 }], 42),
    ]);

    let bootstrapped = harness.bootstrap().unwrap();

    assert_eq!(bootstrapped.info.last_id, OpId::new(1, 2));
    assert_eq!(bootstrapped.info.last_committed_id, OpId::new(1, 1));

    let orphans = &bootstrapped.info.orphaned_replicates;
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].op_id, OpId::new(1, 2));
    assert_eq!(harness.metrics.bootstrap().orphaned_replicates.get(), 1);

    // The uncommitted write was not applied.
    let mrs = bootstrapped.tablet.memrowset().unwrap();
    assert!(mrs.contains_live(&Bytes::from("rowA")));
    assert!(!mrs.contains_live(&Bytes::from("rowB")));
}

#[test]
fn out_of_sequence_replicate_fails_bootstrap() {
    let harness = Harness::new();
    harness.write_segment(&[
        insert_replicate(1, 1, "rowA", "v1"),
        insert_replicate(1, 3, "rowB", "v2"),
    ]);

    let err = harness.bootstrap().unwrap_err();
    assert!(err.is_corruption());
    let msg = err.to_string();
    assert!(
        msg.contains("Unexpected opid following opid 1,1"),
        "message was: {}",
        msg
    );
    // The diagnostic names where in the log the bad entry sat.
    assert!(msg.contains("entry 1 of segment 1"), "message was: {}", msg);
}

#[test]
fn pairing_survives_segment_boundaries() {
    let harness = Harness::new();
    harness.write_segment(&[insert_replicate(1, 1, "rowA", "v1")]);
    harness.write_segment(&[write_commit(
        1,
        1,
        vec![MemStoreTarget::Mrs { mrs_id: 1 }],
        42,
    )]);

    let bootstrapped = harness.bootstrap().unwrap();

    assert!(bootstrapped
        .tablet
        .memrowset()
        .unwrap()
        .contains_live(&Bytes::from("rowA")));
    assert_eq!(harness.metrics.bootstrap().segments_replayed.get(), 2);
    assert_eq!(bootstrapped.info.last_committed_id, OpId::new(1, 1));
}

#[test]
fn resumed_recovery_discards_stray_segments() {
    let harness = Harness::new();

    // The quarantined log from the interrupted attempt.
    harness.write_segment(&[
        insert_replicate(1, 1, "rowA", "v1"),
        write_commit(1, 1, vec![MemStoreTarget::Mrs { mrs_id: 1 }], 42),
    ]);
    harness
        .fs
        .rename(
            harness.fs.tablet_wal_dir(TABLET_ID),
            harness.fs.tablet_wal_recovery_dir(TABLET_ID),
        )
        .unwrap();

    // The interrupted attempt also left a half-rebuilt log and an
    // unrelated file in the live WAL dir.
    harness.write_segment(&[insert_replicate(9, 9, "stray", "x")]);
    std::fs::write(
        harness.fs.tablet_wal_dir(TABLET_ID).join("junk.txt"),
        b"keep me",
    )
    .unwrap();

    let bootstrapped = harness.bootstrap().unwrap();

    assert!(bootstrapped
        .tablet
        .memrowset()
        .unwrap()
        .contains_live(&Bytes::from("rowA")));
    assert!(!harness
        .fs
        .exists(harness.fs.tablet_wal_recovery_dir(TABLET_ID)));

    // The stray segment is gone; the replay wrote a fresh one.
    bootstrapped.log.close().unwrap();
    let entries = harness.read_new_log();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries[0],
        insert_replicate(1, 1, "rowA", "v1"),
        "stray segment should have been discarded"
    );
    assert!(harness
        .fs
        .exists(harness.fs.tablet_wal_recovery_dir(TABLET_ID).join("junk.txt")));
}

#[test]
fn orphan_commit_with_flushed_stores_is_dropped() {
    let harness = Harness::new();
    harness.meta.set_last_durable_mrs_id(5);
    // The replicate lived in a GC'd segment; only its commit remains.
    harness.write_segment(&[write_commit(
        1,
        1,
        vec![MemStoreTarget::Mrs { mrs_id: 1 }],
        42,
    )]);

    let bootstrapped = harness.bootstrap().unwrap();

    assert_eq!(bootstrapped.info.last_id, OpId::MIN);
    assert_eq!(bootstrapped.info.last_committed_id, OpId::new(1, 1));
    assert!(bootstrapped.info.orphaned_replicates.is_empty());
}

#[test]
fn orphan_commit_with_unflushed_store_is_corruption() {
    let harness = Harness::new();
    harness.write_segment(&[write_commit(
        1,
        1,
        vec![MemStoreTarget::Mrs { mrs_id: 1 }],
        42,
    )]);

    let err = harness.bootstrap().unwrap_err();
    assert!(err.is_corruption());
    assert!(err.to_string().contains("orphan commit"), "{}", err);
}

#[test]
fn aborted_operation_is_not_applied() {
    let harness = Harness::new();
    let replicate = insert_replicate(1, 1, "rowA", "v1");
    harness.write_segment(&[
        replicate.clone(),
        LogEntry::commit(CommitMsg {
            op_type: OperationType::Abort,
            committed_op_id: OpId::new(1, 1),
            timestamp: Timestamp::INVALID,
            result: TxResult::default(),
        }),
    ]);

    let clock_before = harness.clock.last();
    let bootstrapped = harness.bootstrap().unwrap();

    // Nothing was applied, and the invalid timestamp never reached the
    // clock.
    assert!(bootstrapped.tablet.memrowset().unwrap().is_empty());
    assert_eq!(harness.clock.last(), clock_before);
    assert_eq!(bootstrapped.info.last_committed_id, OpId::new(1, 1));

    // The new log keeps the replicate but drops the abort's commit.
    bootstrapped.log.close().unwrap();
    assert_eq!(harness.read_new_log(), vec![replicate]);
}

#[test]
fn alter_schema_is_replayed() {
    let harness = Harness::new();
    let commit = CommitMsg {
        op_type: OperationType::AlterSchema,
        committed_op_id: OpId::new(1, 1),
        timestamp: Timestamp(9),
        result: TxResult::default(),
    };
    harness.write_segment(&[
        LogEntry::replicate(
            OpId::new(1, 1),
            ReplicateOp::AlterSchema(AlterSchemaRequest {
                schema: Schema::key_value(2),
            }),
        ),
        LogEntry::commit(commit.clone()),
    ]);

    let bootstrapped = harness.bootstrap().unwrap();

    assert_eq!(bootstrapped.tablet.schema().version, 2);

    // The original commit is appended verbatim.
    bootstrapped.log.close().unwrap();
    let entries = harness.read_new_log();
    assert_eq!(entries.len(), 2);
    assert_eq!(commit_msg(&entries[1]), &commit);
}

#[test]
fn change_config_with_newer_seqno_is_applied() {
    let harness = Harness::new();
    harness.write_segment(&[
        LogEntry::replicate(
            OpId::new(1, 1),
            ReplicateOp::ChangeConfig(ChangeConfigRequest {
                new_config: QuorumConfig::new(5, vec!["peer-a".into(), "peer-b".into()]),
            }),
        ),
        LogEntry::commit(CommitMsg {
            op_type: OperationType::ChangeConfig,
            committed_op_id: OpId::new(1, 1),
            timestamp: Timestamp(3),
            result: TxResult::default(),
        }),
    ]);

    harness.bootstrap().unwrap();

    // The new quorum was persisted by the end-of-bootstrap flush.
    let cmeta = ConsensusMetadata::load(&harness.fs, TABLET_ID).unwrap();
    assert_eq!(cmeta.quorum().seqno, 5);
    assert_eq!(cmeta.quorum().voters.len(), 2);
}

#[test]
fn change_config_with_stale_seqno_is_skipped() {
    let harness = Harness::new();
    harness.write_segment(&[
        LogEntry::replicate(
            OpId::new(1, 1),
            ReplicateOp::ChangeConfig(ChangeConfigRequest {
                new_config: QuorumConfig::new(1, vec!["peer-z".into()]),
            }),
        ),
        LogEntry::commit(CommitMsg {
            op_type: OperationType::ChangeConfig,
            committed_op_id: OpId::new(1, 1),
            timestamp: Timestamp(3),
            result: TxResult::default(),
        }),
    ]);

    harness.bootstrap().unwrap();

    let cmeta = ConsensusMetadata::load(&harness.fs, TABLET_ID).unwrap();
    assert_eq!(cmeta.quorum().seqno, 1);
    assert_eq!(cmeta.quorum().voters, vec!["peer-a".to_string()]);
}

#[test]
fn second_replay_applies_nothing_once_flushed() {
    let harness = Harness::new();
    harness.write_segment(&[
        insert_replicate(1, 1, "rowA", "v1"),
        write_commit(1, 1, vec![MemStoreTarget::Mrs { mrs_id: 1 }], 42),
    ]);

    let first = harness.bootstrap().unwrap();
    assert_eq!(harness.metrics.bootstrap().ops_applied.get(), 1);
    let mrs_id = first.tablet.memrowset().unwrap().id();
    drop(first);

    // Pretend the memrowset was flushed after the first bootstrap.
    harness.meta.set_last_durable_mrs_id(mrs_id);
    harness.meta.flush().unwrap();

    // Replaying the log the first bootstrap produced touches nothing.
    let metrics2 = MetricContext::new();
    let second = bootstrap_tablet(
        &Options::default(),
        Arc::clone(&harness.meta),
        Arc::clone(&harness.clock),
        metrics2.clone(),
        Arc::clone(&harness.listener),
    )
    .unwrap();

    assert_eq!(metrics2.bootstrap().ops_applied.get(), 0);
    assert_eq!(metrics2.bootstrap().ops_already_flushed.get(), 1);
    assert!(second.tablet.memrowset().unwrap().is_empty());
    assert_eq!(second.info.last_committed_id, OpId::new(1, 1));
}

#[test]
fn unexpected_entry_type_is_corruption() {
    let harness = Harness::new();
    harness.write_segment(&[LogEntry::FlushMarker]);

    let err = harness.bootstrap().unwrap_err();
    assert!(err.is_corruption());
    assert!(err.to_string().contains("unexpected log entry type"), "{}", err);
}

#[test]
fn partial_segment_read_replays_prefix_then_fails() {
    let harness = Harness::new();
    harness.write_segment(&[
        insert_replicate(1, 1, "rowA", "v1"),
        write_commit(1, 1, vec![MemStoreTarget::Mrs { mrs_id: 1 }], 42),
        insert_replicate(1, 2, "rowB", "v2"),
    ]);

    // Corrupt the last entry's payload in place.
    let wal_dir = harness.fs.tablet_wal_dir(TABLET_ID);
    let name = harness
        .fs
        .list_dir(&wal_dir)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let path = wal_dir.join(name);
    let mut data = std::fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    std::fs::write(&path, &data).unwrap();

    let err = harness.bootstrap().unwrap_err();
    assert!(err.is_corruption());
    let msg = err.to_string();
    assert!(msg.contains("read up to entry 2"), "message was: {}", msg);
}

#[test]
fn rowsets_without_segments_is_illegal_state() {
    let harness = Harness::new();
    harness.meta.add_rowset(RowSetMetadata {
        rs_id: 1,
        last_durable_redo_dms_id: 0,
    });

    let err = harness.bootstrap().unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)), "got: {}", err);
    assert!(err.to_string().contains("had rowsets but no log"), "{}", err);
}

#[test]
fn unfinished_remote_copy_refuses_local_replay() {
    let harness = Harness::new();
    harness
        .meta
        .set_remote_bootstrap_state(tabletdb::RemoteBootstrapState::Copying);

    let err = harness.bootstrap().unwrap_err();
    assert!(err.is_corruption());
    assert!(err.to_string().contains("COPYING"), "{}", err);
}

#[test]
fn missing_consensus_metadata_fails_loudly() {
    let dir = TempDir::new().unwrap();
    let fs = FsManager::open(dir.path()).unwrap();
    let meta =
        Arc::new(TabletMetadata::create(&fs, TABLET_ID, "users", Schema::key_value(1)).unwrap());
    let listener = Arc::new(TabletStatusListener::new(Arc::clone(&meta)));

    let err = bootstrap_tablet(
        &Options::default(),
        meta,
        Clock::new(),
        MetricContext::new(),
        listener,
    )
    .unwrap_err();
    assert!(
        err.to_string().contains("unable to load consensus metadata"),
        "{}",
        err
    );
}

#[test]
fn skip_remove_flag_keeps_renamed_recovery_dir() {
    let harness = Harness::new();
    harness.write_segment(&[
        insert_replicate(1, 1, "rowA", "v1"),
        write_commit(1, 1, vec![MemStoreTarget::Mrs { mrs_id: 1 }], 42),
    ]);

    let mut options = Options::default();
    options.skip_remove_old_recovery_dir = true;
    bootstrap_tablet(
        &options,
        Arc::clone(&harness.meta),
        Arc::clone(&harness.clock),
        harness.metrics.clone(),
        Arc::clone(&harness.listener),
    )
    .unwrap();

    // Renamed aside but not deleted.
    assert!(!harness
        .fs
        .exists(harness.fs.tablet_wal_recovery_dir(TABLET_ID)));
    let kept: Vec<String> = harness
        .fs
        .list_dir(harness.fs.root().join("wals"))
        .unwrap()
        .into_iter()
        .filter(|n| n.starts_with(&format!("{}-recovery-", TABLET_ID)))
        .collect();
    assert_eq!(kept.len(), 1);
}

#[test]
fn failed_bootstrap_releases_flush_pin() {
    let harness = Harness::new();
    harness.write_segment(&[insert_replicate(1, 1, "rowA", "v1"), insert_replicate(1, 3, "x", "y")]);

    harness.bootstrap().unwrap_err();
    assert!(!harness.meta.is_flush_pinned());
    // A later flush works.
    harness.meta.flush().unwrap();
}

#[test]
fn rows_that_failed_originally_stay_failed() {
    let harness = Harness::new();

    // Two-row write: the first row succeeded, the second failed
    // (e.g. duplicate key) in the original transaction.
    let mut row_ops = RowOperationBatch::new();
    row_ops.insert(&b"rowA"[..], &b"v1"[..]);
    row_ops.insert(&b"rowB"[..], &b"v2"[..]);
    harness.write_segment(&[
        LogEntry::replicate(
            OpId::new(1, 1),
            ReplicateOp::Write(WriteRequest {
                schema: Schema::key_value(1),
                row_ops,
            }),
        ),
        LogEntry::commit(CommitMsg {
            op_type: OperationType::Write,
            committed_op_id: OpId::new(1, 1),
            timestamp: Timestamp(42),
            result: TxResult::new(vec![
                OperationResult::applied(MemStoreTarget::Mrs { mrs_id: 1 }),
                OperationResult::failed("key already present"),
            ]),
        }),
    ]);

    let bootstrapped = harness.bootstrap().unwrap();

    let mrs = bootstrapped.tablet.memrowset().unwrap();
    assert!(mrs.contains_live(&Bytes::from("rowA")));
    assert!(!mrs.contains_live(&Bytes::from("rowB")));

    bootstrapped.log.close().unwrap();
    let entries = harness.read_new_log();
    let commit = commit_msg(&entries[1]);
    assert!(!commit.result.ops[0].is_failed());
    assert!(commit.result.ops[1].is_failed());
}
