//! Registry of op ids pinned by in-memory state.
//!
//! Stores holding un-flushed effects of an operation register an anchor
//! on its op id; log GC must not reclaim segments at or above the
//! minimum anchored id. Anchors are refcounted so several stores can
//! pin the same op.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::OpId;
use crate::{Error, Result};

/// Refcounted registry of anchored op ids.
///
/// Thread-safe; shared via `Arc` between the tablet and the log.
#[derive(Debug, Default)]
pub struct OpIdAnchorRegistry {
    anchors: Mutex<BTreeMap<OpId, usize>>,
}

impl OpIdAnchorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an anchor on `op_id`.
    pub fn register(&self, op_id: OpId) {
        let mut anchors = self.anchors.lock();
        *anchors.entry(op_id).or_insert(0) += 1;
    }

    /// Release one anchor on `op_id`. Releasing an id that was never
    /// registered is an error.
    pub fn unregister(&self, op_id: OpId) -> Result<()> {
        let mut anchors = self.anchors.lock();
        match anchors.get_mut(&op_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                anchors.remove(&op_id);
                Ok(())
            }
            None => Err(Error::not_found(format!(
                "op id {} is not anchored",
                op_id
            ))),
        }
    }

    /// The smallest anchored op id, if any.
    pub fn min_anchored(&self) -> Option<OpId> {
        self.anchors.lock().keys().next().copied()
    }

    /// Number of distinct anchored op ids.
    pub fn num_anchors(&self) -> usize {
        self.anchors.lock().len()
    }
}
