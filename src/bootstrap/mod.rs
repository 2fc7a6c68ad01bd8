//! Tablet bootstrap: rebuild a tablet's in-memory state after restart
//! by replaying its write-ahead log.
//!
//! The previous log is quarantined into a recovery directory and played
//! back entry by entry. Each replicated operation is paired with its
//! later commit record; row-level effects that already reached disk are
//! skipped, the rest are re-applied to the tablet. Replay also rebuilds
//! a faithful new log the tablet can extend once it rejoins its quorum.
//!
//! A bootstrapped tablet can then be added to an existing quorum as a
//! learner, which brings it up to date with the rest of the quorum, or
//! start serving data itself once appointed leader.

mod filter;
mod recovery;
mod replay;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::consensus::{ConsensusMetadata, OpId, OpIdAnchorRegistry};
use crate::fs::FsManager;
use crate::log::{Log, LogReader, ReplicateMsg};
use crate::metrics::MetricContext;
use crate::options::Options;
use crate::tablet::{RemoteBootstrapState, RowArena, Schema, Tablet, TabletMetadata};
use crate::{Error, Result};

use recovery::{prepare_recovery_dir, remove_recovery_dir};
use replay::LogReplayer;

/// Publishes bootstrap progress.
///
/// The last status is kept under a writer lock so an observer (e.g. an
/// admin UI) can read it while bootstrap runs.
pub struct TabletStatusListener {
    meta: Arc<TabletMetadata>,
    last_status: RwLock<String>,
}

impl TabletStatusListener {
    /// Create a listener for the given tablet.
    pub fn new(meta: Arc<TabletMetadata>) -> Self {
        Self {
            meta,
            last_status: RwLock::new(String::new()),
        }
    }

    /// The tablet id.
    pub fn tablet_id(&self) -> &str {
        self.meta.tablet_id()
    }

    /// The table this tablet belongs to.
    pub fn table_name(&self) -> String {
        self.meta.table_name()
    }

    /// The tablet's schema.
    pub fn schema(&self) -> Schema {
        self.meta.schema()
    }

    /// Publish a status message.
    pub fn status_message(&self, status: impl Into<String>) {
        let status = status.into();
        info!(tablet_id = %self.tablet_id(), %status, "tablet status");
        *self.last_status.write() = status;
    }

    /// The most recently published status.
    pub fn last_status(&self) -> String {
        self.last_status.read().clone()
    }
}

/// What replay learned for the consensus layer.
#[derive(Debug, Default)]
pub struct BootstrapInfo {
    /// Id of the last replicate seen in the log.
    pub last_id: OpId,
    /// Highest id known to be committed.
    pub last_committed_id: OpId,
    /// Replicates with no commit/abort record, probably in-flight when
    /// the server crashed. Their resolution is up to consensus.
    pub orphaned_replicates: Vec<ReplicateMsg>,
}

/// A successfully bootstrapped tablet and its fresh log.
#[derive(Debug)]
pub struct BootstrappedTablet {
    /// The rebuilt tablet.
    pub tablet: Tablet,
    /// The rebuilt log, ready for appends.
    pub log: Log,
    /// Anchor registry shared by the tablet and the log.
    pub anchor_registry: Arc<OpIdAnchorRegistry>,
    /// Replay results for the consensus layer.
    pub info: BootstrapInfo,
}

/// Releases a metadata flush pin on drop, so an error path can't leave
/// the tablet pinned.
struct FlushPinGuard<'a> {
    meta: &'a TabletMetadata,
    released: bool,
}

impl<'a> FlushPinGuard<'a> {
    fn pin(meta: &'a TabletMetadata) -> Self {
        meta.pin_flush();
        Self {
            meta,
            released: false,
        }
    }

    fn release(mut self) -> Result<()> {
        self.released = true;
        self.meta.unpin_flush()
    }
}

impl Drop for FlushPinGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.meta.unpin_flush();
        }
    }
}

/// Bootstrap a tablet: quarantine and replay its log, rebuilding the
/// tablet's soft state and a new log.
///
/// On success the returned log has its configured sync mode restored
/// (replay runs with sync disabled for speed).
pub fn bootstrap_tablet(
    options: &Options,
    meta: Arc<TabletMetadata>,
    clock: Arc<Clock>,
    metrics: MetricContext,
    listener: Arc<TabletStatusListener>,
) -> Result<BootstrappedTablet> {
    let bootstrap = TabletBootstrap {
        options: options.clone(),
        meta,
        clock,
        metrics,
        listener,
    };
    let mut bootstrapped = bootstrap.run()?;

    // The new log was opened with sync disabled; nothing may route live
    // traffic at it until its sync mode is restored.
    bootstrapped.log.re_enable_sync_if_required()?;
    Ok(bootstrapped)
}

/// One bootstrap attempt. Single-threaded; exclusively owns the tablet
/// until it completes.
struct TabletBootstrap {
    options: Options,
    meta: Arc<TabletMetadata>,
    clock: Arc<Clock>,
    metrics: MetricContext,
    listener: Arc<TabletStatusListener>,
}

impl TabletBootstrap {
    fn run(self) -> Result<BootstrappedTablet> {
        self.options.validate()?;

        let tablet_id = self.meta.tablet_id().to_string();
        let fs = self.meta.fs_manager().clone();

        // Replay needs the consensus metadata to compare committed
        // quorum seqnos and to persist committed but unflushed changes.
        let mut cmeta = ConsensusMetadata::load(&fs, &tablet_id)
            .map_err(|e| e.prepend("unable to load consensus metadata"))?;

        // Never locally replay a tablet whose seeding copy didn't
        // finish; its files may be incomplete.
        let remote_state = self.meta.remote_bootstrap_state();
        if remote_state != RemoteBootstrapState::Done {
            return Err(Error::corruption(format!(
                "unable to locally bootstrap tablet {}: tablet metadata bootstrap state is {}",
                tablet_id, remote_state
            )));
        }

        let pin = FlushPinGuard::pin(&self.meta);
        self.listener.status_message("Bootstrap starting.");
        debug!(super_block = %self.meta.to_super_block(), "tablet metadata");

        let anchor_registry = Arc::new(OpIdAnchorRegistry::new());
        let mut tablet = Tablet::new(
            Arc::clone(&self.meta),
            Arc::clone(&self.clock),
            Arc::clone(&anchor_registry),
        );
        // No fetch from peer replicas yet; open whatever is local.
        tablet.open()?;
        let fetched_blocks = tablet.num_rowsets() != 0;

        let needs_recovery = prepare_recovery_dir(&fs, &tablet_id)?;

        if !fetched_blocks && !needs_recovery {
            info!(%tablet_id, "no previous blocks or log segments found, creating new tablet");
            let log = self
                .open_new_log(&fs, &tablet_id)
                .map_err(|e| e.prepend("failed to open new log"))?;
            pin.release()?;
            self.listener
                .status_message("No bootstrap required, opened a new log");
            return Ok(BootstrappedTablet {
                tablet,
                log,
                anchor_registry,
                info: BootstrapInfo::default(),
            });
        }

        // If there are rowsets there must be segments to replay: log GC
        // never removes every segment for a tablet with unflushed state.
        if fetched_blocks && !needs_recovery {
            return Err(Error::illegal_state(format!(
                "tablet {} had rowsets but no log segments could be found",
                tablet_id
            )));
        }

        let reader = LogReader::open_from_recovery_dir(&fs, &tablet_id)
            .map_err(|e| e.prepend("could not open log reader"))?;
        let mut log = self
            .open_new_log(&fs, &tablet_id)
            .map_err(|e| e.prepend("failed to open new log"))?;

        let arena = RowArena::new(self.options.arena_block_size, self.options.max_arena_size);
        let mut replayer = LogReplayer::new(
            &tablet,
            &mut log,
            &mut cmeta,
            &reader,
            &self.metrics,
            &self.listener,
            arena,
        );
        replayer
            .play_segments()
            .map_err(|e| e.prepend("failed log replay"))?;
        let replay_state = replayer.finish();

        // Flush the consensus metadata once at the end to persist any
        // replayed config changes.
        cmeta.flush()?;

        pin.release()?;
        remove_recovery_dir(&fs, &tablet_id, self.options.skip_remove_old_recovery_dir)?;
        self.listener.status_message("Bootstrap complete.");

        let info = BootstrapInfo {
            last_id: replay_state.prev_op_id(),
            last_committed_id: replay_state.committed_op_id(),
            orphaned_replicates: replay_state.into_orphaned_replicates(),
        };
        self.metrics
            .bootstrap()
            .orphaned_replicates
            .set(info.orphaned_replicates.len() as i64);
        if !info.orphaned_replicates.is_empty() {
            dump_orphaned_replicates(&tablet_id, &info.orphaned_replicates);
        }

        Ok(BootstrappedTablet {
            tablet,
            log,
            anchor_registry,
            info,
        })
    }

    fn open_new_log(&self, fs: &FsManager, tablet_id: &str) -> Result<Log> {
        let mut log = Log::open(&self.options.log, fs, tablet_id)?;
        // Sync is re-enabled after bootstrap completes, before the
        // tablet takes live traffic.
        log.disable_sync();
        Ok(log)
    }
}

fn dump_orphaned_replicates(tablet_id: &str, ops: &[ReplicateMsg]) {
    info!(
        tablet_id,
        count = ops.len(),
        "WAL included replicate messages with no corresponding commit/abort messages; \
         these operations were probably in-flight when the server crashed"
    );
    for op in ops {
        info!(op_id = %op.op_id, op_type = %op.op.op_type(), "orphaned replicate");
    }
}
