//! Durable tablet metadata: the superblock.
//!
//! Records which in-memory stores have been made durable: the last
//! flushed memrowset id and, per rowset, the last delta memstore whose
//! redo deltas were flushed. Store ids are assigned from 1, so a
//! watermark of 0 means nothing has been flushed yet.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;

use super::Schema;
use crate::fs::FsManager;
use crate::util::coding::{
    decode_fixed32, decode_length_prefixed, decode_varint64, encode_fixed32,
    encode_length_prefixed, encode_varint64,
};
use crate::util::crc::{crc32, mask_crc, verify_masked_crc};
use crate::{Error, Result};

/// State of the copy that seeded this tablet replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteBootstrapState {
    /// The replica's data was fully copied (or created locally).
    Done = 1,
    /// A copy from a peer replica is still in progress.
    Copying = 2,
}

impl RemoteBootstrapState {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RemoteBootstrapState::Done),
            2 => Some(RemoteBootstrapState::Copying),
            _ => None,
        }
    }
}

impl std::fmt::Display for RemoteBootstrapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemoteBootstrapState::Done => "DONE",
            RemoteBootstrapState::Copying => "COPYING",
        };
        f.write_str(name)
    }
}

/// Durable facts about one rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSetMetadata {
    /// Id of the rowset.
    pub rs_id: u64,
    /// Last delta memstore of this rowset whose redo deltas were
    /// flushed; 0 if none.
    pub last_durable_redo_dms_id: u64,
}

/// Tag values for encoding superblock fields.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum SuperBlockTag {
    TableName = 1,
    Schema = 2,
    LastDurableMrsId = 3,
    RowSet = 4,
    RemoteBootstrapState = 5,
}

#[derive(Debug)]
struct State {
    table_name: String,
    schema: Schema,
    last_durable_mrs_id: u64,
    rowsets: Vec<RowSetMetadata>,
    remote_bootstrap_state: RemoteBootstrapState,
}

/// The tablet superblock.
///
/// Thread-safe: the schema can be read while an alter is applied, and
/// flushing can be pinned while a long-running maintenance pass (such as
/// log replay) requires the durability watermarks to hold still.
#[derive(Debug)]
pub struct TabletMetadata {
    fs: FsManager,
    tablet_id: String,
    state: RwLock<State>,
    flush_pins: AtomicU32,
}

impl TabletMetadata {
    /// Create metadata for a new tablet and persist it immediately.
    pub fn create(
        fs: &FsManager,
        tablet_id: &str,
        table_name: &str,
        schema: Schema,
    ) -> Result<Self> {
        let meta = Self {
            fs: fs.clone(),
            tablet_id: tablet_id.to_string(),
            state: RwLock::new(State {
                table_name: table_name.to_string(),
                schema,
                last_durable_mrs_id: 0,
                rowsets: Vec::new(),
                remote_bootstrap_state: RemoteBootstrapState::Done,
            }),
            flush_pins: AtomicU32::new(0),
        };
        meta.flush()?;
        Ok(meta)
    }

    /// Load the superblock for a tablet.
    pub fn load(fs: &FsManager, tablet_id: &str) -> Result<Self> {
        let path = fs.tablet_metadata_path(tablet_id);
        let data = std::fs::read(&path)
            .map_err(|e| Error::Io(format!("read superblock {}: {}", path.display(), e)))?;

        let mut slice: &[u8] = &data;
        let masked = decode_fixed32(&mut slice)
            .ok_or_else(|| Error::corruption("superblock file too short"))?;
        if !verify_masked_crc(slice, masked) {
            return Err(Error::corruption(format!(
                "superblock checksum mismatch for tablet {}",
                tablet_id
            )));
        }

        let state = Self::decode_state(slice)?;
        Ok(Self {
            fs: fs.clone(),
            tablet_id: tablet_id.to_string(),
            state: RwLock::new(state),
            flush_pins: AtomicU32::new(0),
        })
    }

    /// The tablet id.
    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// The table this tablet belongs to.
    pub fn table_name(&self) -> String {
        self.state.read().table_name.clone()
    }

    /// The current schema.
    pub fn schema(&self) -> Schema {
        self.state.read().schema.clone()
    }

    /// Replace the schema. Takes effect on disk at the next flush.
    pub fn set_schema(&self, schema: Schema) {
        self.state.write().schema = schema;
    }

    /// Last memrowset id whose rows were flushed; 0 if none.
    pub fn last_durable_mrs_id(&self) -> u64 {
        self.state.read().last_durable_mrs_id
    }

    /// Record a memrowset flush.
    pub fn set_last_durable_mrs_id(&self, mrs_id: u64) {
        self.state.write().last_durable_mrs_id = mrs_id;
    }

    /// Metadata for a rowset, if it is still live. A missing rowset was
    /// compacted away.
    pub fn rowset(&self, rs_id: u64) -> Option<RowSetMetadata> {
        self.state
            .read()
            .rowsets
            .iter()
            .find(|rs| rs.rs_id == rs_id)
            .copied()
    }

    /// All live rowsets.
    pub fn rowsets(&self) -> Vec<RowSetMetadata> {
        self.state.read().rowsets.clone()
    }

    /// Add a rowset.
    pub fn add_rowset(&self, rowset: RowSetMetadata) {
        self.state.write().rowsets.push(rowset);
    }

    /// State of the copy that seeded this replica.
    pub fn remote_bootstrap_state(&self) -> RemoteBootstrapState {
        self.state.read().remote_bootstrap_state
    }

    /// Record the seeding copy's state.
    pub fn set_remote_bootstrap_state(&self, state: RemoteBootstrapState) {
        self.state.write().remote_bootstrap_state = state;
    }

    /// Block flushes until the matching `unpin_flush`. Pins nest.
    pub fn pin_flush(&self) {
        self.flush_pins.fetch_add(1, Ordering::SeqCst);
    }

    /// Release one flush pin.
    pub fn unpin_flush(&self) -> Result<()> {
        let prev = self.flush_pins.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            self.flush_pins.fetch_add(1, Ordering::SeqCst);
            return Err(Error::illegal_state("flush was not pinned"));
        }
        Ok(())
    }

    /// Whether flushing is currently pinned.
    pub fn is_flush_pinned(&self) -> bool {
        self.flush_pins.load(Ordering::SeqCst) > 0
    }

    /// Persist the superblock. Refuses while flushing is pinned.
    pub fn flush(&self) -> Result<()> {
        if self.is_flush_pinned() {
            return Err(Error::illegal_state(format!(
                "cannot flush superblock of tablet {} while flush is pinned",
                self.tablet_id
            )));
        }

        let payload = self.encode_state();
        let mut file = BytesMut::with_capacity(payload.len() + 4);
        encode_fixed32(&mut file, mask_crc(crc32(&payload)));
        file.extend_from_slice(&payload);

        let path = self.fs.tablet_metadata_path(&self.tablet_id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &file)?;
        let f = std::fs::File::open(&tmp)?;
        f.sync_all()?;
        drop(f);
        self.fs.rename(&tmp, &path)?;
        Ok(())
    }

    /// Human-readable dump of the superblock for diagnostics.
    pub fn to_super_block(&self) -> String {
        let state = self.state.read();
        let mut s = format!(
            "tablet: {} table: {} schema v{} last_durable_mrs_id: {} remote_bootstrap: {}",
            self.tablet_id,
            state.table_name,
            state.schema.version,
            state.last_durable_mrs_id,
            state.remote_bootstrap_state,
        );
        for rs in &state.rowsets {
            s.push_str(&format!(
                "\n  rowset {} last_durable_redo_dms_id: {}",
                rs.rs_id, rs.last_durable_redo_dms_id
            ));
        }
        s
    }

    /// The filesystem this tablet lives on.
    pub fn fs_manager(&self) -> &FsManager {
        &self.fs
    }

    fn encode_state(&self) -> BytesMut {
        let state = self.state.read();
        let mut buf = BytesMut::with_capacity(256);

        buf.put_u8(SuperBlockTag::TableName as u8);
        encode_length_prefixed(&mut buf, state.table_name.as_bytes());

        buf.put_u8(SuperBlockTag::Schema as u8);
        let mut schema_buf = BytesMut::new();
        state.schema.encode_to(&mut schema_buf);
        encode_length_prefixed(&mut buf, &schema_buf);

        buf.put_u8(SuperBlockTag::LastDurableMrsId as u8);
        encode_varint64(&mut buf, state.last_durable_mrs_id);

        for rs in &state.rowsets {
            buf.put_u8(SuperBlockTag::RowSet as u8);
            encode_varint64(&mut buf, rs.rs_id);
            encode_varint64(&mut buf, rs.last_durable_redo_dms_id);
        }

        buf.put_u8(SuperBlockTag::RemoteBootstrapState as u8);
        buf.put_u8(state.remote_bootstrap_state as u8);

        buf
    }

    fn decode_state(mut data: &[u8]) -> Result<State> {
        let mut table_name = None;
        let mut schema = None;
        let mut last_durable_mrs_id = 0;
        let mut rowsets = Vec::new();
        let mut remote_bootstrap_state = RemoteBootstrapState::Done;

        while !data.is_empty() {
            let tag = data[0];
            data = &data[1..];
            match tag {
                t if t == SuperBlockTag::TableName as u8 => {
                    let name = decode_length_prefixed(&mut data)
                        .ok_or_else(|| Error::corruption("superblock table name truncated"))?;
                    table_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::corruption("superblock table name not utf-8"))?,
                    );
                }
                t if t == SuperBlockTag::Schema as u8 => {
                    let raw = decode_length_prefixed(&mut data)
                        .ok_or_else(|| Error::corruption("superblock schema truncated"))?;
                    let mut slice: &[u8] = &raw;
                    schema = Some(Schema::decode_from(&mut slice)?);
                }
                t if t == SuperBlockTag::LastDurableMrsId as u8 => {
                    last_durable_mrs_id = decode_varint64(&mut data)
                        .ok_or_else(|| Error::corruption("superblock mrs id truncated"))?;
                }
                t if t == SuperBlockTag::RowSet as u8 => {
                    let rs_id = decode_varint64(&mut data)
                        .ok_or_else(|| Error::corruption("superblock rowset id truncated"))?;
                    let last_durable_redo_dms_id = decode_varint64(&mut data)
                        .ok_or_else(|| Error::corruption("superblock dms id truncated"))?;
                    rowsets.push(RowSetMetadata {
                        rs_id,
                        last_durable_redo_dms_id,
                    });
                }
                t if t == SuperBlockTag::RemoteBootstrapState as u8 => {
                    if data.is_empty() {
                        return Err(Error::corruption("superblock bootstrap state truncated"));
                    }
                    let b = data[0];
                    data = &data[1..];
                    remote_bootstrap_state = RemoteBootstrapState::from_byte(b).ok_or_else(
                        || Error::corruption(format!("unknown remote bootstrap state: {}", b)),
                    )?;
                }
                t => {
                    return Err(Error::corruption(format!(
                        "unknown superblock field tag: {}",
                        t
                    )));
                }
            }
        }

        Ok(State {
            table_name: table_name
                .ok_or_else(|| Error::corruption("superblock missing table name"))?,
            schema: schema.ok_or_else(|| Error::corruption("superblock missing schema"))?,
            last_durable_mrs_id,
            rowsets,
            remote_bootstrap_state,
        })
    }
}
