//! Log segment reader used during recovery.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::fs::{parse_log_file_name, FsManager};
use crate::util::coding::{decode_length_prefixed, decode_varint64};
use crate::util::crc::verify_masked_crc;
use crate::{Error, Result};

use super::{LogEntry, RecordType, BLOCK_SIZE, HEADER_SIZE, SEGMENT_MAGIC};

/// Low-level reader for the block-based record format.
///
/// Handles fragmented records and verifies masked CRC checksums. Any
/// checksum or framing failure is surfaced as corruption; a truncated
/// record at end-of-file is treated as a clean end (a torn write from
/// the crash that triggered recovery).
struct RecordReader {
    reader: BufReader<File>,
    buffer: Vec<u8>,
    buffer_offset: usize,
    buffer_size: usize,
    eof: bool,
}

impl RecordReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::with_capacity(BLOCK_SIZE * 4, file),
            buffer: vec![0u8; BLOCK_SIZE],
            buffer_offset: 0,
            buffer_size: 0,
            eof: false,
        })
    }

    /// Read the next logical record, reassembling fragments.
    ///
    /// Returns None at end of file.
    fn read_record(&mut self) -> Result<Option<Bytes>> {
        let mut scratch = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Some((record_type, data)) => match record_type {
                    RecordType::Full => {
                        if in_fragmented_record {
                            return Err(Error::corruption(
                                "full record in the middle of a fragmented record",
                            ));
                        }
                        return Ok(Some(Bytes::from(data)));
                    }
                    RecordType::First => {
                        if in_fragmented_record {
                            return Err(Error::corruption(
                                "first fragment in the middle of a fragmented record",
                            ));
                        }
                        scratch.extend_from_slice(&data);
                        in_fragmented_record = true;
                    }
                    RecordType::Middle => {
                        if !in_fragmented_record {
                            return Err(Error::corruption("unexpected middle record fragment"));
                        }
                        scratch.extend_from_slice(&data);
                    }
                    RecordType::Last => {
                        if !in_fragmented_record {
                            return Err(Error::corruption("unexpected last record fragment"));
                        }
                        scratch.extend_from_slice(&data);
                        return Ok(Some(Bytes::from(scratch)));
                    }
                    RecordType::Zero => {
                        // Block padding.
                        continue;
                    }
                },
                None => {
                    // A fragmented record cut off at EOF is a torn write
                    // from the crash; the entries before it are intact.
                    return Ok(None);
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        loop {
            if self.buffer_offset + HEADER_SIZE > self.buffer_size {
                if !self.read_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.buffer[self.buffer_offset..self.buffer_offset + HEADER_SIZE];
            let masked_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type_byte = header[6];

            // An all-zero header is block padding at the tail of a block.
            if masked_crc == 0 && length == 0 && record_type_byte == 0 {
                self.buffer_offset = self.buffer_size;
                continue;
            }

            let record_type = RecordType::from_byte(record_type_byte)
                .ok_or_else(|| Error::corruption("invalid record type"))?;

            if self.buffer_offset + HEADER_SIZE + length > self.buffer_size {
                if self.eof {
                    // Torn final record.
                    return Ok(None);
                }
                return Err(Error::corruption("record extends beyond block"));
            }

            let data_start = self.buffer_offset + HEADER_SIZE;
            let data_end = data_start + length;
            let data = &self.buffer[data_start..data_end];

            let mut crc_data = Vec::with_capacity(1 + length);
            crc_data.push(record_type_byte);
            crc_data.extend_from_slice(data);
            if !verify_masked_crc(&crc_data, masked_crc) {
                return Err(Error::corruption("record checksum mismatch"));
            }

            self.buffer_offset = data_end;
            return Ok(Some((record_type, data.to_vec())));
        }
    }

    fn read_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        self.buffer_offset = 0;
        let bytes_read = self.reader.read(&mut self.buffer)?;

        if bytes_read == 0 {
            self.eof = true;
            self.buffer_size = 0;
            return Ok(false);
        }

        self.buffer_size = bytes_read;
        if bytes_read < BLOCK_SIZE {
            self.eof = true;
        }

        Ok(true)
    }
}

/// Result of reading a whole segment: every entry decoded before the
/// first failure, plus the failure itself if there was one.
#[derive(Debug)]
pub struct SegmentEntries {
    /// Entries decoded in order.
    pub entries: Vec<LogEntry>,
    /// The error that stopped the read, if any.
    pub error: Option<Error>,
}

/// A readable log segment.
#[derive(Debug, Clone)]
pub struct Segment {
    seqno: u64,
    path: PathBuf,
    tablet_id: String,
}

impl Segment {
    /// The segment's sequence number.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode every entry in the segment.
    ///
    /// Never fails outright: entries decoded before a corruption are
    /// returned alongside the error so the caller can replay the intact
    /// prefix.
    pub fn read_entries(&self) -> SegmentEntries {
        let mut entries = Vec::new();
        let error = match self.read_entries_inner(&mut entries) {
            Ok(()) => None,
            Err(e) => Some(e),
        };
        SegmentEntries { entries, error }
    }

    fn read_entries_inner(&self, entries: &mut Vec<LogEntry>) -> Result<()> {
        let mut reader = RecordReader::open(&self.path)?;

        let header = reader
            .read_record()?
            .ok_or_else(|| Error::corruption("segment has no header record"))?;
        self.check_header(&header)?;

        while let Some(record) = reader.read_record()? {
            entries.push(LogEntry::decode(&record)?);
        }
        Ok(())
    }

    fn check_header(&self, header: &[u8]) -> Result<()> {
        let mut buf = header;
        if buf.len() < SEGMENT_MAGIC.len() || &buf[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
            return Err(Error::corruption(format!(
                "bad segment magic in {}",
                self.path.display()
            )));
        }
        buf = &buf[SEGMENT_MAGIC.len()..];

        let seqno = decode_varint64(&mut buf)
            .ok_or_else(|| Error::corruption("segment header seqno truncated"))?;
        if seqno != self.seqno {
            return Err(Error::corruption(format!(
                "segment {} declares sequence number {} but its name implies {}",
                self.path.display(),
                seqno,
                self.seqno
            )));
        }

        let tablet_id = decode_length_prefixed(&mut buf)
            .ok_or_else(|| Error::corruption("segment header tablet id truncated"))?;
        if tablet_id != self.tablet_id.as_bytes() {
            return Err(Error::corruption(format!(
                "segment {} belongs to tablet {:?}, expected {}",
                self.path.display(),
                String::from_utf8_lossy(&tablet_id),
                self.tablet_id
            )));
        }
        Ok(())
    }
}

/// Reader over the segments quarantined in a tablet's recovery
/// directory, ordered by sequence number.
#[derive(Debug)]
pub struct LogReader {
    segments: Vec<Segment>,
}

impl LogReader {
    /// Discover the segments in the tablet's WAL recovery directory.
    pub fn open_from_recovery_dir(fs: &FsManager, tablet_id: &str) -> Result<Self> {
        let recovery_dir = fs.tablet_wal_recovery_dir(tablet_id);
        if !fs.exists(&recovery_dir) {
            return Err(Error::not_found(format!(
                "recovery dir {} does not exist",
                recovery_dir.display()
            )));
        }

        let mut segments = Vec::new();
        for name in fs.list_dir(&recovery_dir)? {
            if let Some(seqno) = parse_log_file_name(&name) {
                segments.push(Segment {
                    seqno,
                    path: recovery_dir.join(&name),
                    tablet_id: tablet_id.to_string(),
                });
            }
        }
        segments.sort_by_key(|s| s.seqno);

        Ok(Self { segments })
    }

    /// Snapshot of the discovered segments, in log-sequence order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of discovered segments.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}
