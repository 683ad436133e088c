//! Writes each bucket to `<logPath>/<sourceKey>/<bucket>.now` (rewritten
//! every flush) and `<logPath>/<sourceKey>/<prefix><bucket>.log` (appended),
//! with size-triggered rotation into zip archives under `<archivePath>`.
//!
//! `prefix` is `""` while archiving is disabled, else `"<ts>-"` where `<ts>`
//! is the 14-digit zero-padded millisecond stamp of the last rotation
//! boundary (`archiveStamper`). Only one rotation runs at a time per
//! instance (`archivingInFlight`), following the same single-mutex
//! re-entrancy guard the async file-watch loop in `config/runtime_reload.rs`
//! uses.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use walkdir::WalkDir;

use crate::collector::{format, Verbosity};
use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::profiling::hit::Hit;
use crate::profiling::target::Stats;

#[derive(Debug, Clone)]
pub struct FileLoggerConfig {
    pub log_path: PathBuf,
    pub archive_path: PathBuf,
    pub max_log_size_bytes: u64,
    pub log_request_archiving_modulo: u64,
    pub max_archive_size_bytes: u64,
}

impl Default for FileLoggerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./logs"),
            archive_path: PathBuf::from("./logs/archive"),
            max_log_size_bytes: 0,
            log_request_archiving_modulo: 100,
            max_archive_size_bytes: 0,
        }
    }
}

pub struct FileLogger {
    source_key: String,
    config: RwLock<FileLoggerConfig>,
    prefix: Mutex<String>,
    request_counter: AtomicU64,
    archiving_in_flight: AsyncMutex<()>,
    on_error: Arc<dyn Fn(String) + Send + Sync>,
}

impl FileLogger {
    pub fn new(source_key: impl Into<String>, config: FileLoggerConfig) -> Self {
        Self {
            source_key: source_key.into(),
            config: RwLock::new(config),
            prefix: Mutex::new(String::new()),
            request_counter: AtomicU64::new(0),
            archiving_in_flight: AsyncMutex::new(()),
            on_error: Arc::new(|msg| tracing::warn!("file logger: {msg}")),
        }
        .with_initial_stamper()
    }

    fn with_initial_stamper(self) -> Self {
        if self.archiving_enabled() {
            *self.prefix.lock() = format!("{}-", stamp_now());
        }
        self
    }

    fn archiving_enabled(&self) -> bool {
        let config = self.config.read();
        config.max_log_size_bytes > 0 && config.log_request_archiving_modulo > 0
    }

    fn source_dir(&self) -> PathBuf {
        self.config.read().log_path.join(&self.source_key)
    }

    fn archive_dir(&self) -> PathBuf {
        self.config.read().archive_path.join(&self.source_key)
    }

    fn prefix(&self) -> String {
        self.prefix.lock().clone()
    }

    /// Changes `logPath` only if the new directory can be created; on
    /// failure the old value is retained and the error is reported.
    pub async fn set_log_path(&self, new_path: PathBuf) {
        match tokio::fs::create_dir_all(&new_path).await {
            Ok(()) => self.config.write().log_path = new_path,
            Err(e) => (self.on_error)(format!("set_log_path({new_path:?}) failed: {e}")),
        }
    }

    pub async fn set_archive_path(&self, new_path: PathBuf) {
        match tokio::fs::create_dir_all(&new_path).await {
            Ok(()) => self.config.write().archive_path = new_path,
            Err(e) => (self.on_error)(format!("set_archive_path({new_path:?}) failed: {e}")),
        }
    }

    async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.source_dir())
            .await
            .map_err(|e| Error::LoggerIo(e.to_string()))?;
        if self.archiving_enabled() {
            tokio::fs::create_dir_all(self.archive_dir())
                .await
                .map_err(|e| Error::LoggerIo(e.to_string()))?;
        }
        Ok(())
    }

    async fn write_now(&self, bucket: &str, content: &str) {
        let path = self.source_dir().join(format!("{bucket}.now"));
        if let Err(e) = tokio::fs::write(&path, content).await {
            (self.on_error)(format!("write {path:?} failed: {e}"));
        }
    }

    async fn append_log(&self, bucket: &str, line: &str) {
        let path = self.source_dir().join(format!("{}{bucket}.log", self.prefix()));
        let mut opts = tokio::fs::OpenOptions::new();
        opts.create(true).append(true);
        match opts.open(&path).await {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            Err(e) => (self.on_error)(format!("append {path:?} failed: {e}")),
        }
    }

    async fn maybe_rotate(&self) {
        if !self.archiving_enabled() {
            return;
        }
        let modulo = self.config.read().log_request_archiving_modulo;
        let count = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if modulo == 0 || count % modulo != 0 {
            return;
        }
        self.rotate().await;
    }

    async fn rotate(&self) {
        let Ok(_guard) = self.archiving_in_flight.try_lock() else {
            return;
        };
        if let Err(e) = self.ensure_dirs().await {
            (self.on_error)(format!("rotation skipped, directories unavailable: {e}"));
            return;
        }
        if let Err(e) = self.orphan_sweep().await {
            (self.on_error)(format!("orphan sweep failed: {e}"));
        }
        if let Err(e) = self.current_sweep().await {
            (self.on_error)(format!("current sweep failed: {e}"));
        }
        if let Err(e) = self.trim_archives().await {
            (self.on_error)(format!("archive trim failed: {e}"));
        }
    }

    /// `.log` files not bearing the current prefix belong to a previous,
    /// unfinished rotation (most likely a crash); sweep them into a
    /// `-orphaned.zip` stamped with *now*, not their own mtime.
    async fn orphan_sweep(&self) -> Result<()> {
        let current_prefix = self.prefix();
        let dir = self.source_dir();
        let mut orphans = Vec::new();
        for entry in WalkDir::new(&dir).max_depth(1).into_iter().flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".log") {
                continue;
            }
            if name.starts_with(&current_prefix) {
                continue;
            }
            orphans.push(path.to_path_buf());
        }
        if orphans.is_empty() {
            return Ok(());
        }

        let archive_name = format!("{}-orphaned.zip", stamp_now());
        let archive_path = self.archive_dir().join(archive_name);
        zip_and_delete(&orphans, &archive_path).await?;
        Ok(())
    }

    /// If the current prefix's `.log` + `.now` files have together grown to
    /// `maxLogSizeBytes`, roll a new stamper immediately (so concurrent
    /// writers land in the new files) and zip the captured `.log` files
    /// under the *old* stamp. `.now` files are never archived or deleted.
    async fn current_sweep(&self) -> Result<()> {
        let current_prefix = self.prefix();
        let dir = self.source_dir();
        let max_size = self.config.read().max_log_size_bytes;

        let mut matched_logs = Vec::new();
        let mut total: u64 = 0;
        for entry in WalkDir::new(&dir).max_depth(1).into_iter().flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_log = name.starts_with(&current_prefix) && name.ends_with(".log");
            let is_now = name.ends_with(".now");
            if !is_log && !is_now {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
            if is_log {
                matched_logs.push(path.to_path_buf());
            }
        }

        if total < max_size {
            return Ok(());
        }

        let old_stamp = current_prefix.trim_end_matches('-').to_string();
        *self.prefix.lock() = format!("{}-", stamp_now());

        if matched_logs.is_empty() {
            return Ok(());
        }
        let archive_path = self.archive_dir().join(format!("{old_stamp}.zip"));
        zip_and_delete(&matched_logs, &archive_path).await?;
        Ok(())
    }

    /// Deletes oldest `*.zip` archives by mtime until the directory total
    /// drops below `maxArchiveSizeBytes`; `0` keeps only the single newest.
    async fn trim_archives(&self) -> Result<()> {
        let max_size = self.config.read().max_archive_size_bytes;
        let dir = self.archive_dir();

        let mut archives: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        for entry in WalkDir::new(&dir).max_depth(1).into_iter().flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zip") {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
            archives.push((path.to_path_buf(), meta.len(), mtime));
        }
        archives.sort_by_key(|(_, _, mtime)| *mtime);

        let mut total: u64 = archives.iter().map(|(_, size, _)| size).sum();

        if max_size == 0 {
            // Keep only the newest archive.
            while archives.len() > 1 {
                let (path, size, _) = archives.remove(0);
                let _ = tokio::fs::remove_file(&path).await;
                total = total.saturating_sub(size);
            }
            return Ok(());
        }

        while total >= max_size && !archives.is_empty() {
            let (path, size, _) = archives.remove(0);
            let _ = tokio::fs::remove_file(&path).await;
            total = total.saturating_sub(size);
        }
        Ok(())
    }
}

fn stamp_now() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{millis:014}")
}

async fn zip_and_delete(files: &[PathBuf], archive_path: &Path) -> Result<()> {
    let files = files.to_vec();
    let archive_path = archive_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        if let Some(parent) = archive_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&archive_path)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for path in &files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let contents = std::fs::read(path)?;
            writer.start_file(name, options)?;
            writer.write_all(&contents)?;
        }
        writer.finish()?;

        for path in &files {
            std::fs::remove_file(path)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::Archive(e.to_string()))??;
    Ok(())
}

#[async_trait]
impl Logger for FileLogger {
    async fn log_hit(&self, stats: &Stats, table: &[Stats], hit: &Hit, verbosity: Verbosity) {
        let bucket = &stats.bucket_key;
        let content = match verbosity {
            Verbosity::Log => format::format_log(hit),
            Verbosity::Brief => format::format_brief(std::slice::from_ref(stats), hit),
            Verbosity::Full => format::format_full(table, hit),
        };
        if self.ensure_dirs().await.is_err() {
            return;
        }
        self.write_now(bucket, &content).await;
        self.append_log(bucket, &content).await;
        self.maybe_rotate().await;
    }

    async fn log_text(&self, bucket_key: &str, text: &str) {
        if self.ensure_dirs().await.is_err() {
            return;
        }
        self.write_now(bucket_key, text).await;
        self.append_log(bucket_key, text).await;
        self.maybe_rotate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> FileLoggerConfig {
        FileLoggerConfig {
            log_path: dir.path().join("logs"),
            archive_path: dir.path().join("archive"),
            max_log_size_bytes: 0,
            log_request_archiving_modulo: 100,
            max_archive_size_bytes: 0,
        }
    }

    #[tokio::test]
    async fn prefix_is_empty_when_archiving_disabled() {
        let dir = TempDir::new().unwrap();
        let logger = FileLogger::new("src1", config(&dir));
        assert_eq!(logger.prefix(), "");
    }

    #[tokio::test]
    async fn prefix_is_stamped_when_archiving_enabled() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.max_log_size_bytes = 1024;
        let logger = FileLogger::new("src1", cfg);
        assert!(logger.prefix().ends_with('-'));
        assert_eq!(logger.prefix().len(), 15);
    }

    #[tokio::test]
    async fn log_text_writes_now_and_log_files() {
        let dir = TempDir::new().unwrap();
        let logger = FileLogger::new("src1", config(&dir));
        logger.log_text("bucket-a", "hello world").await;

        let now_path = dir.path().join("logs/src1/bucket-a.now");
        let log_path = dir.path().join("logs/src1/bucket-a.log");
        assert!(now_path.exists());
        assert!(log_path.exists());
        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(contents.contains("hello world"));
    }

    #[tokio::test]
    async fn trim_keeps_only_newest_when_max_is_zero() {
        let dir = TempDir::new().unwrap();
        let archive_dir = dir.path().join("archive/src1");
        tokio::fs::create_dir_all(&archive_dir).await.unwrap();
        for name in ["1.zip", "2.zip", "3.zip"] {
            tokio::fs::write(archive_dir.join(name), b"x").await.unwrap();
        }
        let logger = FileLogger::new("src1", config(&dir));
        logger.trim_archives().await.unwrap();

        let remaining: Vec<_> = std::fs::read_dir(&archive_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(remaining.len(), 1);
    }
}
