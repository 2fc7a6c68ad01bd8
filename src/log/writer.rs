//! Log segment writer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;

use crate::fs::{log_file_name, parse_log_file_name, FsManager};
use crate::options::{LogOptions, SyncMode};
use crate::util::coding::{encode_length_prefixed, encode_varint64};
use crate::util::crc::{crc32_multi, mask_crc};
use crate::{Error, Result};

use super::{LogEntry, RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_SIZE};

/// Low-level writer for the block-based record format.
#[derive(Debug)]
struct RecordWriter {
    writer: BufWriter<File>,
    block_offset: usize,
}

impl RecordWriter {
    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Io(format!("create {}: {}", path.display(), e)))?;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            block_offset: 0,
        })
    }

    /// Add a record, fragmenting across blocks as needed.
    fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data.len();
        let mut ptr = 0;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            // Switch to a new block if we can't fit a header.
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.writer.write_all(&vec![0u8; leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = std::cmp::min(left, avail);
            let end = left == fragment_length;

            let record_type = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            self.emit_physical_record(record_type, &data[ptr..ptr + fragment_length])?;

            ptr += fragment_length;
            left -= fragment_length;
            begin = false;

            if left == 0 {
                return Ok(());
            }
        }
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= MAX_RECORD_SIZE);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let masked_crc = mask_crc(crc32_multi(&[&[record_type.to_byte()], data]));

        // Header format: CRC (4) + Length (2) + Type (1)
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&masked_crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = record_type.to_byte();

        self.writer.write_all(&header)?;
        self.writer.write_all(data)?;

        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// The tablet's write-ahead log.
///
/// Appends entries to the current segment in the live WAL directory.
/// Sync behavior follows the configured mode, except that syncing can be
/// temporarily disabled (bootstrap does this for replay speed) and later
/// restored with `re_enable_sync_if_required`.
#[derive(Debug)]
pub struct Log {
    writer: RecordWriter,
    requested_sync: SyncMode,
    sync_disabled: bool,
    seqno: u64,
    path: PathBuf,
}

impl Log {
    /// Open a new log segment in the tablet's live WAL directory.
    ///
    /// The next sequence number follows the highest segment already in
    /// the directory; a fresh directory starts at 1.
    pub fn open(opts: &LogOptions, fs: &FsManager, tablet_id: &str) -> Result<Self> {
        let wal_dir = fs.tablet_wal_dir(tablet_id);
        fs.create_dir_if_missing(&wal_dir)?;

        let max_seqno = fs
            .list_dir(&wal_dir)?
            .iter()
            .filter_map(|name| parse_log_file_name(name))
            .max()
            .unwrap_or(0);
        let seqno = max_seqno + 1;

        let path = wal_dir.join(log_file_name(seqno));
        let mut writer = RecordWriter::create(&path)?;

        let mut header = BytesMut::with_capacity(64);
        header.extend_from_slice(super::SEGMENT_MAGIC);
        encode_varint64(&mut header, seqno);
        encode_length_prefixed(&mut header, tablet_id.as_bytes());
        writer.add_record(&header)?;

        let mut log = Self {
            writer,
            requested_sync: opts.sync_mode,
            sync_disabled: false,
            seqno,
            path,
        };
        log.maybe_sync()?;
        Ok(log)
    }

    /// The current segment's sequence number.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Path of the current segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry to the log.
    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let encoded = entry.encode();
        self.writer.add_record(&encoded)?;
        self.maybe_sync()
    }

    /// Temporarily disable syncing, regardless of the configured mode.
    pub fn disable_sync(&mut self) {
        self.sync_disabled = true;
    }

    /// Restore the configured sync mode, syncing immediately if the
    /// mode demands it so nothing appended while disabled is lost.
    pub fn re_enable_sync_if_required(&mut self) -> Result<()> {
        if !self.sync_disabled {
            return Ok(());
        }
        self.sync_disabled = false;
        if self.requested_sync == SyncMode::Always {
            self.writer.sync()?;
        }
        Ok(())
    }

    /// Force a sync to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync()
    }

    /// Flush and sync the log, consuming it.
    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.sync()
    }

    fn maybe_sync(&mut self) -> Result<()> {
        if self.sync_disabled {
            return Ok(());
        }
        match self.requested_sync {
            SyncMode::Always => self.writer.sync(),
            SyncMode::None => self.writer.flush(),
        }
    }
}
