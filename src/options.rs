//! Configuration options for tabletdb.

/// Default decode-arena block size (256KB).
pub const DEFAULT_ARENA_BLOCK_SIZE: usize = 256 * 1024;

/// Maximum decode-arena size (4MB).
pub const MAX_ARENA_SIZE: usize = 4 * 1024 * 1024;

/// WAL sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Sync on every append (safest, slowest).
    #[default]
    Always,
    /// Let OS decide when to sync (fastest, may lose recent appends on crash).
    None,
}

/// Options controlling the write-ahead log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Sync mode requested by the caller. The log may temporarily
    /// disable syncing (e.g. during replay) and restore this mode later.
    pub sync_mode: SyncMode,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Always,
        }
    }
}

/// Tablet server configuration options.
#[derive(Debug, Clone)]
pub struct Options {
    // === Durability ===
    /// WAL options.
    pub log: LogOptions,

    // === Recovery ===
    /// Skip removing the WAL recovery dir after startup. Useful for
    /// debugging a failed replay; the renamed dir is left on disk.
    pub skip_remove_old_recovery_dir: bool,

    // === Decode ===
    /// Initial block size for the row-decode arena.
    pub arena_block_size: usize,

    /// Cap on total row-decode arena memory.
    pub max_arena_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log: LogOptions::default(),
            skip_remove_old_recovery_dir: false,
            arena_block_size: DEFAULT_ARENA_BLOCK_SIZE,
            max_arena_size: MAX_ARENA_SIZE,
        }
    }
}

impl Options {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.arena_block_size < 1024 {
            return Err(crate::Error::invalid_argument(
                "arena_block_size must be at least 1KB",
            ));
        }

        if self.max_arena_size < self.arena_block_size {
            return Err(crate::Error::invalid_argument(
                "max_arena_size must be at least arena_block_size",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = Options::default();
        assert!(options.validate().is_ok());
        assert!(!options.skip_remove_old_recovery_dir);
        assert_eq!(options.log.sync_mode, SyncMode::Always);
    }

    #[test]
    fn test_validate_rejects_tiny_arena() {
        let mut options = Options::default();
        options.arena_block_size = 16;
        assert!(options.validate().is_err());

        let mut options = Options::default();
        options.max_arena_size = options.arena_block_size - 1;
        assert!(options.validate().is_err());
    }
}
