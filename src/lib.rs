//! # tabletdb
//!
//! An embedded distributed-tablet storage engine core. A tablet is a
//! horizontally-partitioned replica of a table: fresh inserts land in
//! an in-memory memrowset, mutations of flushed rows are buffered in
//! per-rowset delta memstores, and every operation is made durable in a
//! segmented write-ahead log before it is applied.
//!
//! The centerpiece is **bootstrap**: after a restart, a tablet's
//! in-memory state is rebuilt by quarantining the previous log into a
//! recovery directory and replaying it against the durable state, row
//! by row, while writing a faithful new log for the tablet to extend.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tabletdb::{
//!     bootstrap_tablet, Clock, FsManager, MetricContext, Options, Schema,
//!     TabletMetadata, TabletStatusListener,
//! };
//!
//! let fs = FsManager::open("./data")?;
//! let meta = Arc::new(TabletMetadata::load(&fs, "tablet-1")?);
//! let listener = Arc::new(TabletStatusListener::new(Arc::clone(&meta)));
//!
//! let bootstrapped = bootstrap_tablet(
//!     &Options::default(),
//!     meta,
//!     Clock::new(),
//!     MetricContext::new(),
//!     listener,
//! )?;
//! // bootstrapped.tablet is ready; bootstrapped.info goes to consensus.
//! ```

// Public modules
pub mod error;
pub mod options;

// Subsystems
mod bootstrap;
mod clock;
mod consensus;
mod fs;
mod log;
mod metrics;
mod tablet;
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{LogOptions, Options, SyncMode};

// Bootstrap
pub use bootstrap::{
    bootstrap_tablet, BootstrapInfo, BootstrappedTablet, TabletStatusListener,
};

// Clock
pub use clock::{Clock, Timestamp};

// Consensus
pub use consensus::{ConsensusMetadata, OpId, OpIdAnchorRegistry, QuorumConfig};

// Filesystem layout
pub use fs::FsManager;

// Log
pub use log::{
    AlterSchemaRequest, ChangeConfigRequest, CommitMsg, Log, LogEntry, LogReader, MemStoreTarget,
    Operation, OperationResult, OperationType, ReplicateMsg, ReplicateOp, RowOperation,
    RowOperationBatch, Segment, SegmentEntries, TxResult, WriteRequest,
};

// Metrics
pub use metrics::{BootstrapMetrics, Counter, Gauge, MetricContext};

// Tablet
pub use tablet::{
    ColumnSchema, ColumnType, DeltaMemStore, MemRowSet, RemoteBootstrapState, RowArena, RowChange,
    RowSet, RowSetMetadata, Schema, Tablet, TabletMetadata, WriteTransactionState,
};
