//! Full-tree reconciliation and the atomic single-file copy primitive.

use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::config::{Pair, SyncStrategy};
use crate::error::{Error, Result};
use crate::filter::PathFilter;
use crate::hooks::HookSink;
use crate::utils::rel_path;

pub const COPY_BUFFER_SIZE: usize = 8 * 1024 * 1024;
pub const HASH_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Tolerance when comparing modification times across filesystems with
/// different timestamp granularity.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// Statistics of one `compare_and_sync` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub files_deleted: u64,
    pub files_skipped: u64,
}

/// Performs source → target reconciliation for one pair.
pub struct Copier<'a> {
    pair: &'a Pair,
    filter: PathFilter,
    hooks: &'a dyn HookSink,
}

impl<'a> Copier<'a> {
    pub fn new(pair: &'a Pair, hooks: &'a dyn HookSink) -> Self {
        let filter = PathFilter::new(&pair.include_extensions, &pair.exclude_globs);
        Self { pair, filter, hooks }
    }

    /// Walk the source tree and copy every included file whose content
    /// changed; when the pair mirrors deletes, remove target files without
    /// a surviving source counterpart. The first I/O error aborts the walk
    /// (partial totals are logged before the error is returned).
    pub async fn compare_and_sync(&self, token: &CancellationToken) -> Result<SyncStats> {
        let started = Instant::now();
        let mut stats = SyncStats::default();

        let outcome = self.perform_sync(token, &mut stats).await;
        if let Err(err) = outcome {
            error!(
                pair = %self.pair.id,
                files = stats.files_copied,
                bytes = stats.bytes_copied,
                error = %err,
                "sync aborted"
            );
            return Err(err);
        }

        info!(
            pair = %self.pair.id,
            files = stats.files_copied,
            bytes = stats.bytes_copied,
            deleted = stats.files_deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync completed"
        );
        Ok(stats)
    }

    async fn perform_sync(&self, token: &CancellationToken, stats: &mut SyncStats) -> Result<()> {
        fs::create_dir_all(&self.pair.target)?;
        self.sync_source_to_target(token, stats).await?;
        if self.pair.mirror_deletes {
            self.mirror_deletions(token, stats)?;
        }
        Ok(())
    }

    async fn sync_source_to_target(
        &self,
        token: &CancellationToken,
        stats: &mut SyncStats,
    ) -> Result<()> {
        for entry in WalkDir::new(&self.pair.source) {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let rel = rel_path(&self.pair.source, path);

            if !self.should_sync_file(path) {
                stats.files_skipped += 1;
                continue;
            }
            if !self.is_file_changed(path, &rel)? {
                stats.files_skipped += 1;
                continue;
            }

            let target = self.pair.target.join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = copy_atomic(path, &target)?;
            stats.files_copied += 1;
            stats.bytes_copied += bytes;
            info!(pair = %self.pair.id, file = %rel, bytes, "copied");

            self.hooks.file_synced(token, self.pair, &rel).await;
        }
        Ok(())
    }

    /// Composite include/exclude decision on the full source path.
    fn should_sync_file(&self, path: &Path) -> bool {
        self.filter.check(path)
    }

    fn is_file_changed(&self, source: &Path, rel: &str) -> Result<bool> {
        let source_meta = fs::metadata(source)?;
        let target = self.pair.target.join(rel);
        let target_meta = match fs::metadata(&target) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };

        match self.pair.sync_strategy {
            SyncStrategy::Hash => Ok(hash_file(source)? != hash_file(&target)?),
            SyncStrategy::Mtime => Ok(differs_by_mtime_and_size(&source_meta, &target_meta)),
        }
    }

    fn mirror_deletions(&self, token: &CancellationToken, stats: &mut SyncStats) -> Result<()> {
        for entry in WalkDir::new(&self.pair.target) {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = rel_path(&self.pair.target, entry.path());
            let source = self.pair.source.join(&rel);

            // remove files with no surviving, included source counterpart
            if source.is_file() && self.should_sync_file(&source) {
                continue;
            }
            if let Err(err) = fs::remove_file(entry.path()) {
                error!(pair = %self.pair.id, file = %rel, error = %err, "failed to delete target file");
                return Err(err.into());
            }
            stats.files_deleted += 1;
            info!(pair = %self.pair.id, file = %rel, "deleted (mirror)");
        }
        Ok(())
    }
}

fn differs_by_mtime_and_size(source: &fs::Metadata, target: &fs::Metadata) -> bool {
    if source.len() != target.len() {
        return true;
    }
    let source_mtime = FileTime::from_last_modification_time(source);
    let target_mtime = FileTime::from_last_modification_time(target);
    let diff = (source_mtime.unix_seconds() - target_mtime.unix_seconds()).unsigned_abs();
    diff > MTIME_TOLERANCE.as_secs()
}

/// Copy `src` over `dst` through `<dst>.tmp` so readers of `dst` only ever
/// see the previous or the new content. The source mtime is preserved on a
/// best-effort basis; on any failure the temp file is removed.
pub fn copy_atomic(src: &Path, dst: &Path) -> io::Result<u64> {
    let tmp = tmp_path(dst);

    let bytes = match write_copy(src, &tmp) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
    };

    if let Ok(meta) = fs::metadata(src) {
        let _ = filetime::set_file_mtime(&tmp, FileTime::from_last_modification_time(&meta));
    }

    if let Err(err) = fs::rename(&tmp, dst) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(bytes)
}

fn write_copy(src: &Path, tmp: &Path) -> io::Result<u64> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(tmp)?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

fn tmp_path(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// SHA-256 of the file contents as a lowercase hex string, streamed in
/// large chunks.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
