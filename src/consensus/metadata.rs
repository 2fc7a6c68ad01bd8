//! Durable consensus metadata: the committed quorum configuration.

use bytes::{BufMut, BytesMut};

use crate::fs::FsManager;
use crate::util::coding::{
    decode_fixed32, decode_length_prefixed, decode_varint64, encode_fixed32,
    encode_length_prefixed, encode_varint64,
};
use crate::util::crc::{crc32, mask_crc, verify_masked_crc};
use crate::{Error, Result};

/// Tag values for encoding quorum fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum QuorumTag {
    Seqno = 1,
    Voter = 2,
}

/// A sequence-numbered quorum configuration.
///
/// Configurations are totally ordered by `seqno`; a replayed config
/// change only takes effect if its seqno is strictly greater than the
/// committed one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuorumConfig {
    /// Sequence number of this configuration.
    pub seqno: u64,
    /// Ids of the voting members.
    pub voters: Vec<String>,
}

impl QuorumConfig {
    /// Create a config with the given seqno and voters.
    pub fn new(seqno: u64, voters: Vec<String>) -> Self {
        Self { seqno, voters }
    }

    pub(crate) fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(QuorumTag::Seqno as u8);
        encode_varint64(&mut buf, self.seqno);
        for voter in &self.voters {
            buf.put_u8(QuorumTag::Voter as u8);
            encode_length_prefixed(&mut buf, voter.as_bytes());
        }
        buf
    }

    pub(crate) fn decode(mut data: &[u8]) -> Result<Self> {
        let mut config = QuorumConfig::default();
        while !data.is_empty() {
            let tag = data[0];
            data = &data[1..];
            match tag {
                t if t == QuorumTag::Seqno as u8 => {
                    config.seqno = decode_varint64(&mut data)
                        .ok_or_else(|| Error::corruption("quorum seqno truncated"))?;
                }
                t if t == QuorumTag::Voter as u8 => {
                    let voter = decode_length_prefixed(&mut data)
                        .ok_or_else(|| Error::corruption("quorum voter truncated"))?;
                    let voter = String::from_utf8(voter.to_vec())
                        .map_err(|_| Error::corruption("quorum voter is not utf-8"))?;
                    config.voters.push(voter);
                }
                t => {
                    return Err(Error::corruption(format!("unknown quorum field tag: {}", t)));
                }
            }
        }
        Ok(config)
    }
}

/// Durable consensus metadata for one tablet.
///
/// Holds the committed quorum configuration. Mutations are buffered in
/// memory and persisted by `flush()`; bootstrap flushes once at the end
/// of replay rather than per config change.
#[derive(Debug)]
pub struct ConsensusMetadata {
    fs: FsManager,
    tablet_id: String,
    quorum: QuorumConfig,
    dirty: bool,
}

impl ConsensusMetadata {
    /// Create metadata for a new tablet and persist it immediately.
    pub fn create(fs: &FsManager, tablet_id: &str, quorum: QuorumConfig) -> Result<Self> {
        let mut cmeta = Self {
            fs: fs.clone(),
            tablet_id: tablet_id.to_string(),
            quorum,
            dirty: true,
        };
        cmeta.flush()?;
        Ok(cmeta)
    }

    /// Load the metadata for a tablet. A missing file is an error: the
    /// tablet cannot participate in replication without one.
    pub fn load(fs: &FsManager, tablet_id: &str) -> Result<Self> {
        let path = fs.consensus_metadata_path(tablet_id);
        if !fs.exists(&path) {
            return Err(Error::not_found(format!(
                "consensus metadata for tablet {} at {}",
                tablet_id,
                path.display()
            )));
        }

        let data = std::fs::read(&path)?;
        let mut slice: &[u8] = &data;
        let masked = decode_fixed32(&mut slice)
            .ok_or_else(|| Error::corruption("consensus metadata file too short"))?;
        if !verify_masked_crc(slice, masked) {
            return Err(Error::corruption(format!(
                "consensus metadata checksum mismatch for tablet {}",
                tablet_id
            )));
        }

        Ok(Self {
            fs: fs.clone(),
            tablet_id: tablet_id.to_string(),
            quorum: QuorumConfig::decode(slice)?,
            dirty: false,
        })
    }

    /// The committed quorum configuration.
    pub fn quorum(&self) -> &QuorumConfig {
        &self.quorum
    }

    /// Replace the committed quorum configuration. Takes effect on disk
    /// at the next `flush()`.
    pub fn set_quorum(&mut self, quorum: QuorumConfig) {
        self.quorum = quorum;
        self.dirty = true;
    }

    /// Persist the current state. Writes to a temp file and renames so a
    /// crash never leaves a torn metadata file. No-op if nothing changed.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let payload = self.quorum.encode();
        let mut file = BytesMut::with_capacity(payload.len() + 4);
        encode_fixed32(&mut file, mask_crc(crc32(&payload)));
        file.extend_from_slice(&payload);

        let path = self.fs.consensus_metadata_path(&self.tablet_id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &file)?;
        let f = std::fs::File::open(&tmp)?;
        f.sync_all()?;
        drop(f);
        self.fs.rename(&tmp, &path)?;

        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let quorum = QuorumConfig::new(3, vec!["peer-a".into(), "peer-b".into()]);
        ConsensusMetadata::create(&fs, "tablet-1", quorum.clone()).unwrap();

        let cmeta = ConsensusMetadata::load(&fs, "tablet-1").unwrap();
        assert_eq!(cmeta.quorum(), &quorum);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let err = ConsensusMetadata::load(&fs, "absent").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_set_quorum_persists_on_flush() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        let mut cmeta =
            ConsensusMetadata::create(&fs, "t", QuorumConfig::new(1, vec!["a".into()])).unwrap();
        cmeta.set_quorum(QuorumConfig::new(5, vec!["a".into(), "b".into()]));

        // Not yet flushed: a fresh load still sees seqno 1.
        assert_eq!(ConsensusMetadata::load(&fs, "t").unwrap().quorum().seqno, 1);

        cmeta.flush().unwrap();
        let reloaded = ConsensusMetadata::load(&fs, "t").unwrap();
        assert_eq!(reloaded.quorum().seqno, 5);
        assert_eq!(reloaded.quorum().voters.len(), 2);
    }

    #[test]
    fn test_load_detects_corruption() {
        let dir = tempdir().unwrap();
        let fs = FsManager::open(dir.path()).unwrap();

        ConsensusMetadata::create(&fs, "t", QuorumConfig::new(1, vec![])).unwrap();

        let path = fs.consensus_metadata_path("t");
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        assert!(ConsensusMetadata::load(&fs, "t").unwrap_err().is_corruption());
    }
}
