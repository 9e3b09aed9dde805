//! Crash-safe file replacement.
//!
//! Every state file Veil writes goes through [`write_atomic`]: the new
//! contents land in a sibling temporary file which is synced and then renamed
//! over the target, so readers only ever observe a complete old or complete
//! new document.

use std::ffi::OsString;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Mode applied to state files.
pub const FILE_MODE: u32 = 0o600;

/// Mode applied to directories created for state files.
pub const DIR_MODE: u32 = 0o700;

/// Path of the temporary sibling used while replacing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Create `dir` (and parents) with owner-only permissions if it does not exist.
pub async fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if fs::try_exists(dir).await? {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .await
}

/// Replace `path` with `contents` atomically, leaving the file mode 0600.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_private_dir(parent).await?;
    }

    let tmp = temp_path(path);
    if let Err(err) = write_and_sync(&tmp, contents).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }

    // Persist the rename itself; not every filesystem allows syncing a directory
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        match fs::File::open(parent).await {
            Ok(dir) => {
                if let Err(err) = dir.sync_all().await {
                    debug!(dir = %parent.display(), "directory sync skipped: {err}");
                }
            }
            Err(err) => debug!(dir = %parent.display(), "directory sync skipped: {err}"),
        }
    }

    Ok(())
}

async fn write_and_sync(tmp: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(tmp)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    // A pre-existing temp file keeps its old mode on open
    fs::set_permissions(tmp, std::fs::Permissions::from_mode(FILE_MODE)).await
}

/// Remove a temporary file left behind by an interrupted [`write_atomic`].
///
/// Returns whether a stale file was found.
pub async fn discard_stale_temp(path: &Path) -> bool {
    let tmp = temp_path(path);
    match fs::remove_file(&tmp).await {
        Ok(()) => {
            warn!(file = %tmp.display(), "discarded incomplete state file from an interrupted write");
            true
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!(file = %tmp.display(), "failed to remove stale temp file: {err}");
            true
        }
    }
}
