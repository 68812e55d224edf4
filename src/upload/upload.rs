// SPDX-License-Identifier: GPL-2.0-or-later

use common::UploadId;
use std::{
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use thiserror::Error;

const CHUNK_SUFFIX: &str = "chunk";

/// Append-safe chunk store under `<cache>/.temp/<upload_id>/<i>.chunk` with
/// final assembly into the cache directory.
pub struct UploadManager {
    cache_dir: PathBuf,
    temp_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum NewUploadManagerError {
    #[error("create temp dir: {0}")]
    CreateTempDir(std::io::Error),
}

#[derive(Debug, Error)]
pub enum SaveChunkError {
    #[error("create chunk dir: {0}")]
    CreateChunkDir(std::io::Error),

    #[error("write chunk: {0}")]
    WriteChunk(std::io::Error),

    #[error("rename chunk: {0}")]
    RenameChunk(std::io::Error),
}

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("missing chunk {0}")]
    MissingChunk(u32),

    #[error("create final file: {0}")]
    CreateFinalFile(std::io::Error),

    #[error("read chunk {0}: {1}")]
    ReadChunk(u32, std::io::Error),

    #[error("write final file: {0}")]
    WriteFinalFile(std::io::Error),

    #[error("remove chunk dir: {0}")]
    RemoveChunkDir(std::io::Error),
}

impl UploadManager {
    pub fn new(cache_dir: &Path) -> Result<Self, NewUploadManagerError> {
        let temp_dir = cache_dir.join(".temp");
        std::fs::create_dir_all(&temp_dir).map_err(NewUploadManagerError::CreateTempDir)?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            temp_dir,
        })
    }

    fn chunk_dir(&self, id: &UploadId) -> PathBuf {
        self.temp_dir.join(&**id)
    }

    fn chunk_path(&self, id: &UploadId, index: u32) -> PathBuf {
        self.chunk_dir(id).join(format!("{index}.{CHUNK_SUFFIX}"))
    }

    /// Writes one chunk atomically: temp file first, then rename.
    pub fn save_chunk(&self, id: &UploadId, index: u32, data: &[u8]) -> Result<(), SaveChunkError> {
        use SaveChunkError::*;
        let dir = self.chunk_dir(id);
        std::fs::create_dir_all(&dir).map_err(CreateChunkDir)?;

        let final_path = self.chunk_path(id, index);
        let temp_path = dir.join(format!("{index}.{CHUNK_SUFFIX}.tmp"));

        let mut file = std::fs::File::create(&temp_path).map_err(WriteChunk)?;
        file.write_all(data).map_err(WriteChunk)?;
        file.sync_all().map_err(WriteChunk)?;
        drop(file);

        std::fs::rename(&temp_path, &final_path).map_err(RenameChunk)
    }

    /// Sorted indices still missing. All of them when nothing arrived yet.
    #[must_use]
    pub fn missing_chunks(&self, id: &UploadId, total: u32) -> Vec<u32> {
        (0..total)
            .filter(|i| !self.chunk_path(id, *i).exists())
            .collect()
    }

    #[must_use]
    pub fn is_complete(&self, id: &UploadId, total: u32) -> bool {
        self.missing_chunks(id, total).is_empty()
    }

    /// Concatenates all chunks in index order into `final_name` inside the
    /// cache directory and removes the chunk directory.
    pub fn assemble(
        &self,
        id: &UploadId,
        total: u32,
        final_name: &str,
    ) -> Result<PathBuf, AssembleError> {
        use AssembleError::*;

        // Strip any path components a client may have smuggled in.
        let final_name = Path::new(final_name)
            .file_name()
            .map(|v| v.to_string_lossy().to_string())
            .unwrap_or_default();
        let final_path = self.cache_dir.join(final_name);

        let mut out = std::fs::File::create(&final_path).map_err(CreateFinalFile)?;
        for index in 0..total {
            let data =
                std::fs::read(self.chunk_path(id, index)).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        MissingChunk(index)
                    } else {
                        ReadChunk(index, e)
                    }
                })?;
            out.write_all(&data).map_err(WriteFinalFile)?;
        }
        out.sync_all().map_err(WriteFinalFile)?;
        drop(out);

        std::fs::remove_dir_all(self.chunk_dir(id)).map_err(RemoveChunkDir)?;
        Ok(final_path)
    }

    /// Removes chunk directories untouched for longer than `max_age`.
    /// Returns how many were swept.
    #[must_use]
    pub fn sweep_stale(&self, max_age: Duration) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.temp_dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut swept = 0;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let stale = now
                .duration_since(modified)
                .map_or(false, |age| age > max_age);
            if stale && std::fs::remove_dir_all(entry.path()).is_ok() {
                swept += 1;
            }
        }
        swept
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn new_manager() -> (TempDir, UploadManager) {
        let temp_dir = TempDir::new().unwrap();
        let manager = UploadManager::new(temp_dir.path()).unwrap();
        (temp_dir, manager)
    }

    fn id(s: &str) -> UploadId {
        s.parse().unwrap()
    }

    #[test]
    fn out_of_order_reassembly_is_byte_identical() {
        let (_temp_dir, manager) = new_manager();
        let upload = id("upload-1");

        let original: Vec<u8> = (0u32..10_000).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<&[u8]> = original.chunks(997).collect();
        let total = u32::try_from(chunks.len()).unwrap();

        // Deliver in a scrambled order.
        let mut order: Vec<u32> = (0..total).collect();
        order.reverse();
        order.swap(0, 3);
        for i in order {
            manager
                .save_chunk(&upload, i, chunks[i as usize])
                .unwrap();
        }

        assert!(manager.is_complete(&upload, total));
        assert_eq!(Vec::<u32>::new(), manager.missing_chunks(&upload, total));

        let final_path = manager.assemble(&upload, total, "clip.mp4").unwrap();
        assert_eq!(original, std::fs::read(&final_path).unwrap());
        // Chunk directory is gone.
        assert!(manager.missing_chunks(&upload, total).len() == total as usize);
    }

    #[test]
    fn missing_chunks_absent_dir() {
        let (_temp_dir, manager) = new_manager();
        assert_eq!(vec![0, 1, 2], manager.missing_chunks(&id("nope"), 3));
        assert!(!manager.is_complete(&id("nope"), 3));
    }

    #[test]
    fn missing_chunks_partial() {
        let (_temp_dir, manager) = new_manager();
        let upload = id("partial");
        manager.save_chunk(&upload, 1, b"b").unwrap();
        manager.save_chunk(&upload, 3, b"d").unwrap();
        assert_eq!(vec![0, 2], manager.missing_chunks(&upload, 4));
    }

    #[test]
    fn assemble_missing_chunk_fails() {
        let (_temp_dir, manager) = new_manager();
        let upload = id("gap");
        manager.save_chunk(&upload, 0, b"a").unwrap();
        assert!(matches!(
            manager.assemble(&upload, 2, "x.mp4"),
            Err(AssembleError::MissingChunk(1))
        ));
    }

    #[test]
    fn final_name_is_sanitized() {
        let (temp_dir, manager) = new_manager();
        let upload = id("sneaky");
        manager.save_chunk(&upload, 0, b"data").unwrap();
        let path = manager.assemble(&upload, 1, "../../etc/evil.mp4").unwrap();
        assert_eq!(temp_dir.path().join("evil.mp4"), path);
    }

    #[test]
    fn overwriting_chunk_is_safe() {
        let (_temp_dir, manager) = new_manager();
        let upload = id("retry");
        manager.save_chunk(&upload, 0, b"first").unwrap();
        manager.save_chunk(&upload, 0, b"second").unwrap();
        let path = manager.assemble(&upload, 1, "out.bin").unwrap();
        assert_eq!(b"second".to_vec(), std::fs::read(path).unwrap());
    }

    #[test]
    fn sweep_removes_only_stale_dirs() {
        let (_temp_dir, manager) = new_manager();
        manager.save_chunk(&id("fresh"), 0, b"x").unwrap();
        // Nothing is older than an hour.
        assert_eq!(0, manager.sweep_stale(Duration::from_secs(3600)));
        // Everything is older than a millisecond.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(1, manager.sweep_stale(Duration::from_millis(1)));
        assert_eq!(vec![0], manager.missing_chunks(&id("fresh"), 1));
    }
}
