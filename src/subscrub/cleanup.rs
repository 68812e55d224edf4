// SPDX-License-Identifier: GPL-2.0-or-later

use common::{ArcLogger, ILogger, LogEntry, LogLevel};
use std::{
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;
use upload::UploadManager;

/// Cache entries untouched for this long are deleted.
const MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Time between sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodically deletes aged cache files and abandoned upload chunk
/// directories until the token cancels.
pub async fn sweep_loop(
    token: CancellationToken,
    logger: ArcLogger,
    cache_dir: std::path::PathBuf,
    uploads: Arc<UploadManager>,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }

        let cache_dir2 = cache_dir.clone();
        let uploads2 = uploads.clone();
        let result =
            tokio::task::spawn_blocking(move || sweep_once(&cache_dir2, &uploads2, MAX_AGE)).await;

        match result {
            Ok((files, chunk_dirs)) if files + chunk_dirs > 0 => {
                logger.log(LogEntry::new(
                    LogLevel::Info,
                    "cleanup",
                    format!("removed {files} cache files and {chunk_dirs} upload directories"),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                logger.log(LogEntry::new(
                    LogLevel::Error,
                    "cleanup",
                    format!("sweep failed: {e}"),
                ));
            }
        }
    }
}

/// One sweep pass. Dotfiles and directories (the chunk store handles its
/// own) are left alone. Returns `(files_removed, chunk_dirs_removed)`.
fn sweep_once(cache_dir: &Path, uploads: &UploadManager, max_age: Duration) -> (u64, u64) {
    let mut removed = 0;
    let now = SystemTime::now();

    if let Ok(entries) = std::fs::read_dir(cache_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let stale = now
                .duration_since(modified)
                .map_or(false, |age| age > max_age);
            if stale && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }

    let chunk_dirs = uploads.sweep_stale(max_age);
    (removed, chunk_dirs)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn sweep_respects_age_and_dotfiles() {
        let temp_dir = TempDir::new().unwrap();
        let uploads = UploadManager::new(temp_dir.path()).unwrap();

        std::fs::write(temp_dir.path().join("video.mp4"), b"x").unwrap();
        std::fs::write(temp_dir.path().join(".keep"), b"x").unwrap();

        // Everything is fresh.
        assert_eq!(
            (0, 0),
            sweep_once(temp_dir.path(), &uploads, Duration::from_secs(3600))
        );

        // Everything qualifies, but the dotfile survives.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            (1, 0),
            sweep_once(temp_dir.path(), &uploads, Duration::from_millis(1))
        );
        assert!(temp_dir.path().join(".keep").exists());
        assert!(!temp_dir.path().join("video.mp4").exists());
    }
}
