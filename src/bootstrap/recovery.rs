//! Quarantine and cleanup of WAL directories across crash-restart
//! cycles.
//!
//! Replay never reads the live WAL directory: the previous log is first
//! moved aside into the recovery directory with one atomic rename, and
//! a fresh live directory receives the log rebuilt during replay. If
//! the process crashes mid-replay, the next attempt finds the recovery
//! directory, throws away whatever the aborted replay wrote to the live
//! directory, and starts over from the same quarantined segments.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::fs::{is_log_file_name, FsManager};
use crate::Result;

/// Prepare the recovery directory for a tablet, returning whether there
/// is a log to replay.
///
/// Three cases:
/// - The recovery dir already exists: a previous replay attempt crashed.
///   Delete any segments the aborted attempt wrote to the live WAL dir
///   and resume from the recovery dir.
/// - The live WAL dir holds no segments: nothing to replay.
/// - Otherwise: atomically rename the live WAL dir to the recovery dir
///   and re-create an empty live dir. The rename is the crash-safety
///   pivot; after it, a rerun takes the resume branch.
pub(crate) fn prepare_recovery_dir(fs: &FsManager, tablet_id: &str) -> Result<bool> {
    let log_dir = fs.tablet_wal_dir(tablet_id);
    let recovery_dir = fs.tablet_wal_recovery_dir(tablet_id);

    if fs.exists(&recovery_dir) {
        info!(
            tablet_id,
            recovery_dir = %recovery_dir.display(),
            "replaying from previous recovery directory"
        );
        if fs.exists(&log_dir) {
            for child in fs
                .list_dir(&log_dir)
                .map_err(|e| e.prepend("couldn't list log segments"))?
            {
                if !is_log_file_name(&child) {
                    continue;
                }
                let path = log_dir.join(&child);
                info!(
                    tablet_id,
                    path = %path.display(),
                    "removing old log file from previous aborted recovery attempt"
                );
                fs.delete_file(&path)?;
            }
        } else {
            fs.create_dir_if_missing(&log_dir)
                .map_err(|e| e.prepend("failed to create log dir"))?;
        }
        return Ok(true);
    }

    if !fs.exists(&log_dir) {
        fs.create_dir_if_missing(&log_dir)
            .map_err(|e| e.prepend("failed to create log dir"))?;
        return Ok(false);
    }

    let needs_recovery = fs
        .list_dir(&log_dir)
        .map_err(|e| e.prepend("couldn't list log segments"))?
        .iter()
        .any(|child| is_log_file_name(child));

    if needs_recovery {
        fs.rename(&log_dir, &recovery_dir).map_err(|e| {
            e.prepend(format!(
                "could not move log directory {} to recovery dir {}",
                log_dir.display(),
                recovery_dir.display()
            ))
        })?;
        info!(
            tablet_id,
            log_dir = %log_dir.display(),
            recovery_dir = %recovery_dir.display(),
            "moved log directory to recovery directory"
        );
        fs.create_dir_if_missing(&log_dir)
            .map_err(|e| e.prepend("failed to recreate log directory"))?;
    }

    Ok(needs_recovery)
}

/// Remove the recovery directory after a successful replay.
///
/// The dir is first renamed with a timestamp suffix, making the
/// "recovery is gone" checkpoint atomic, then deleted (unless the debug
/// switch asks to keep it).
pub(crate) fn remove_recovery_dir(
    fs: &FsManager,
    tablet_id: &str,
    skip_remove: bool,
) -> Result<()> {
    let recovery_dir = fs.tablet_wal_recovery_dir(tablet_id);
    debug_assert!(
        fs.exists(&recovery_dir),
        "recovery dir {} does not exist",
        recovery_dir.display()
    );

    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let tmp_path = recovery_dir.with_file_name(format!(
        "{}-{}",
        recovery_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        micros
    ));

    fs.rename(&recovery_dir, &tmp_path).map_err(|e| {
        e.prepend(format!(
            "could not rename old recovery dir from {} to {}",
            recovery_dir.display(),
            tmp_path.display()
        ))
    })?;
    info!(
        tablet_id,
        renamed_to = %tmp_path.display(),
        "renamed old recovery dir"
    );

    if skip_remove {
        info!(
            tablet_id,
            path = %tmp_path.display(),
            "skip_remove_old_recovery_dir enabled, NOT removing"
        );
        return Ok(());
    }

    fs.delete_recursively(&tmp_path)
        .map_err(|e| e.prepend("could not remove renamed recovery dir"))?;
    info!(tablet_id, "removed renamed recovery dir");
    Ok(())
}
