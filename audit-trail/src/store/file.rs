//! 文件版缓冲存储（FileBackingStore）
//!
//! 为拥有持久卷的服务提供可跨进程重启的审计缓冲：
//! - 事件以 JSON Lines 追加写入 `audit-events-<纳秒时间戳>.jsonl`，
//!   文件超过 `max_file_size` 后轮转；时间戳严格递增且定宽，字典序即时间序；
//! - 每次写入在返回前完成 write + fsync，崩溃后已确认的事件不会丢失；
//! - `read_batch` 只处理最旧的一个文件；若它正是当前写入文件，则强制下次写入轮转；
//! - 无法解析的行连同元数据写入 `audit-events-deadletter-<时间戳>.jsonl`，
//!   随后从源文件中剔除，同一行只会进入死信一次；其余记录照常返回，源文件在提交后删除；
//! - 总大小使用缓存计数器（写入累加、提交扣减），在 `update_metrics` 中与文件系统对账。
//!   容量检查是尽力而为的近似值，最多可能超出一条记录的大小。
//!
use super::{BackingStore, Batch};
use crate::error::{AuditError, AuditResult};
use crate::event::AuditEvent;
use crate::metrics::{StoreMetrics, StoreOp};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

const EVENT_FILE_PREFIX: &str = "audit-events-";
const DEAD_LETTER_PREFIX: &str = "audit-events-deadletter-";
const FILE_SUFFIX: &str = ".jsonl";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// 缓冲目录（必填）
    pub directory: Option<PathBuf>,
    /// 单文件大小上限，超过后轮转（默认 10 MiB）
    pub max_file_size: Option<u64>,
    /// 目录总大小上限；未设置或为 0 表示不限制
    pub max_total_size: Option<u64>,
}

impl FileStoreConfig {
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct FileState {
    current_file: Option<PathBuf>,
    last_stamp: u128,
}

impl FileState {
    fn next_stamp(&mut self) -> u128 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }
}

#[derive(Serialize)]
struct DeadLetterEntry {
    timestamp: String,
    source_file: String,
    raw_data: String,
    error: String,
}

pub struct FileBackingStore {
    directory: PathBuf,
    max_file_size: u64,
    max_total_size: Option<u64>,
    state: Mutex<FileState>,
    total_size: Arc<AtomicU64>,
    metrics: StoreMetrics,
}

impl FileBackingStore {
    pub async fn init(config: FileStoreConfig, registry: &Registry) -> AuditResult<Self> {
        let directory = match config.directory {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => {
                return Err(AuditError::invalid_config(
                    "directory is required for file backing store",
                ));
            }
        };
        let max_file_size = config
            .max_file_size
            .unwrap_or(FileStoreConfig::DEFAULT_MAX_FILE_SIZE);
        if max_file_size == 0 {
            return Err(AuditError::invalid_config(
                "max_file_size must be greater than zero for file backing store",
            ));
        }
        let max_total_size = config.max_total_size.filter(|limit| *limit > 0);

        create_private_dir(&directory).await?;

        let metrics = StoreMetrics::register(
            registry,
            "Current total size of the backing store in bytes.",
            true,
        )?;

        let files = list_event_files(&directory).await?;
        let total = total_size_of(&files).await;
        let last_stamp = files
            .iter()
            .filter_map(|path| stamp_of(path))
            .max()
            .unwrap_or_default();

        tracing::debug!(
            directory = %directory.display(),
            files = files.len(),
            bytes = total,
            "file backing store initialized"
        );

        Ok(Self {
            directory,
            max_file_size,
            max_total_size,
            state: Mutex::new(FileState {
                current_file: None,
                last_stamp,
            }),
            total_size: Arc::new(AtomicU64::new(total)),
            metrics,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// 缓存的总字节数（可能与磁盘存在短暂偏差）
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    fn new_file_path(&self, prefix: &str, state: &mut FileState) -> PathBuf {
        self.directory
            .join(format!("{prefix}{:020}{FILE_SUFFIX}", state.next_stamp()))
    }

    async fn current_or_rotated(&self, state: &mut FileState) -> AuditResult<PathBuf> {
        if let Some(current) = &state.current_file {
            match fs::metadata(current).await {
                Ok(meta) if meta.len() < self.max_file_size => return Ok(current.clone()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_failure(&self.metrics, StoreOp::WriteStat)(err)),
            }
        }
        Ok(self.new_file_path(EVENT_FILE_PREFIX, state))
    }

    async fn append_line(&self, path: &Path, line: &[u8]) -> AuditResult<()> {
        let mut file = open_append(path)
            .await
            .map_err(io_failure(&self.metrics, StoreOp::WriteOpen))?;
        file.write_all(line)
            .await
            .map_err(io_failure(&self.metrics, StoreOp::WriteIo))?;
        file.flush()
            .await
            .map_err(io_failure(&self.metrics, StoreOp::WriteIo))?;
        file.sync_all()
            .await
            .map_err(io_failure(&self.metrics, StoreOp::WriteSync))?;
        file.shutdown()
            .await
            .map_err(io_failure(&self.metrics, StoreOp::WriteClose))?;
        Ok(())
    }

    async fn read_events(
        &self,
        path: &Path,
        state: &mut FileState,
    ) -> AuditResult<Vec<AuditEvent>> {
        let mut file = fs::File::open(path)
            .await
            .map_err(io_failure(&self.metrics, StoreOp::ReadOpen))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(io_failure(&self.metrics, StoreOp::ReadScan))?;

        let source_file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut events = Vec::new();
        let mut kept = Vec::with_capacity(content.len());
        let mut corrupted = Vec::new();
        for line in content.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<AuditEvent>(line) {
                Ok(event) => {
                    events.push(event);
                    kept.extend_from_slice(line);
                    kept.push(b'\n');
                }
                Err(err) => {
                    self.metrics.record_error(StoreOp::CorruptedEvent);
                    corrupted.push(DeadLetterEntry {
                        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
                        source_file: source_file.clone(),
                        raw_data: String::from_utf8_lossy(line).into_owned(),
                        error: format!("failed to unmarshal event: {err}"),
                    });
                }
            }
        }

        if !corrupted.is_empty() {
            let dead_letter = self.new_file_path(DEAD_LETTER_PREFIX, state);
            match write_dead_letters(&dead_letter, &corrupted).await {
                Ok(()) => {
                    tracing::warn!(
                        source_file = %source_file,
                        dead_letter = %dead_letter.display(),
                        count = corrupted.len(),
                        "corrupted audit events moved to dead-letter file"
                    );
                    self.metrics
                        .errors
                        .with_label_values(&[StoreOp::DeadLetterWrite.as_str()])
                        .inc_by(corrupted.len() as u64);

                    // 损坏行只进入死信一次：源文件只保留可解析的行
                    let removed = (content.len() as u64).saturating_sub(kept.len() as u64);
                    match replace_contents(path, &kept).await {
                        Ok(()) => {
                            let _ = self.total_size.fetch_update(
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                |current| Some(current.saturating_sub(removed)),
                            );
                        }
                        Err(err) => {
                            tracing::error!(
                                source_file = %source_file,
                                error = %err,
                                "failed to strip corrupted lines from source file"
                            );
                            self.metrics.record_error(StoreOp::DeadLetterRewrite);
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(
                        source_file = %source_file,
                        error = %err,
                        "failed to write to dead-letter file"
                    );
                    self.metrics.record_error(StoreOp::DeadLetterWriteFailed);
                }
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn write(&self, event: &AuditEvent) -> AuditResult<()> {
        let mut line = serde_json::to_vec(event).map_err(|err| {
            self.metrics.record_error(StoreOp::WriteMarshal);
            AuditError::from(err)
        })?;
        line.push(b'\n');

        let mut state = self.state.lock().await;
        let target = self.current_or_rotated(&mut state).await?;
        state.current_file = Some(target.clone());

        if let Some(limit) = self.max_total_size {
            let current = self.total_size.load(Ordering::Acquire);
            if current >= limit {
                self.metrics.record_error(StoreOp::WriteFull);
                return Err(AuditError::StoreFull { current, limit });
            }
        }

        self.append_line(&target, &line).await?;
        self.total_size
            .fetch_add(line.len() as u64, Ordering::AcqRel);
        self.metrics.writes.inc();
        Ok(())
    }

    async fn read_batch(&self) -> AuditResult<Option<Batch>> {
        let mut state = self.state.lock().await;
        let files = list_event_files(&self.directory).await?;

        for path in files {
            if state.current_file.as_deref() == Some(path.as_path()) {
                // 读写不能指向同一文件
                state.current_file = None;
            }

            let events = self.read_events(&path, &mut state).await?;
            if events.is_empty() {
                // 空文件或全部损坏（已转入死信），直接清理
                remove_and_account(&path, &self.total_size, &self.metrics).await?;
                continue;
            }

            self.metrics.reads.inc_by(events.len() as u64);
            let total_size = self.total_size.clone();
            let metrics = self.metrics.clone();
            return Ok(Some(Batch::new(events, move || async move {
                remove_and_account(&path, &total_size, &metrics).await
            })));
        }

        Ok(None)
    }

    async fn update_metrics(&self) -> AuditResult<()> {
        let files = list_event_files(&self.directory).await?;
        let total = total_size_of(&files).await;

        // 与文件系统对账，纠正缓存计数的漂移
        self.total_size.store(total, Ordering::Release);

        self.metrics.size.set(total as i64);
        if let Some(files_gauge) = &self.metrics.files {
            files_gauge.set(files.len() as i64);
        }
        Ok(())
    }

    async fn close(&self) -> AuditResult<()> {
        self.state.lock().await.current_file = None;
        Ok(())
    }
}

fn io_failure(metrics: &StoreMetrics, op: StoreOp) -> impl FnOnce(io::Error) -> AuditError + '_ {
    move |source| {
        metrics.record_error(op);
        AuditError::io(op.as_str(), source)
    }
}

async fn create_private_dir(directory: &Path) -> AuditResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(directory)
        .await
        .map_err(|err| AuditError::io("create_dir", err))
}

async fn open_append(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

async fn write_dead_letters(path: &Path, entries: &[DeadLetterEntry]) -> AuditResult<()> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }

    let mut file = open_append(path)
        .await
        .map_err(|err| AuditError::io("deadletter_open", err))?;
    file.write_all(&buf)
        .await
        .map_err(|err| AuditError::io("deadletter_write", err))?;
    file.flush()
        .await
        .map_err(|err| AuditError::io("deadletter_write", err))?;
    file.sync_all()
        .await
        .map_err(|err| AuditError::io("deadletter_sync", err))?;
    Ok(())
}

/// 以临时文件 + fsync + rename 的方式原子替换文件内容
async fn replace_contents(path: &Path, content: &[u8]) -> AuditResult<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(&temp)
        .await
        .map_err(|err| AuditError::io("deadletter_rewrite", err))?;
    file.write_all(content)
        .await
        .map_err(|err| AuditError::io("deadletter_rewrite", err))?;
    file.flush()
        .await
        .map_err(|err| AuditError::io("deadletter_rewrite", err))?;
    file.sync_all()
        .await
        .map_err(|err| AuditError::io("deadletter_rewrite", err))?;
    drop(file);

    fs::rename(&temp, path)
        .await
        .map_err(|err| AuditError::io("deadletter_rewrite", err))
}

async fn remove_and_account(
    path: &Path,
    total_size: &AtomicU64,
    metrics: &StoreMetrics,
) -> AuditResult<()> {
    let size = file_size(path).await;
    fs::remove_file(path)
        .await
        .map_err(io_failure(metrics, StoreOp::CommitRemove))?;
    let _ = total_size.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(size))
    });
    Ok(())
}

/// 按文件名排序的事件文件列表（不含死信文件）
async fn list_event_files(directory: &Path) -> AuditResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(directory)
        .await
        .map_err(|err| AuditError::io("read_dir", err))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| AuditError::io("read_dir", err))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if is_file && is_event_file_name(&entry.file_name().to_string_lossy()) {
            files.push(entry.path());
        }
    }

    files.sort();
    Ok(files)
}

fn is_event_file_name(name: &str) -> bool {
    name.starts_with(EVENT_FILE_PREFIX)
        && !name.starts_with(DEAD_LETTER_PREFIX)
        && name.ends_with(FILE_SUFFIX)
}

fn stamp_of(path: &Path) -> Option<u128> {
    path.file_name()?
        .to_str()?
        .strip_prefix(EVENT_FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

async fn file_size(path: &Path) -> u64 {
    fs::metadata(path).await.map(|meta| meta.len()).unwrap_or(0)
}

async fn total_size_of(files: &[PathBuf]) -> u64 {
    let mut total = 0;
    for file in files {
        total += file_size(file).await;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store_in(dir: &Path, config: FileStoreConfig) -> FileBackingStore {
        let config = FileStoreConfig {
            directory: Some(dir.to_path_buf()),
            ..config
        };
        FileBackingStore::init(config, &Registry::new()).await.unwrap()
    }

    fn event(id: &str) -> AuditEvent {
        AuditEvent::new(id)
            .with_field("action", "update")
            .with_field("target", json!({"type": "project", "id": id}))
    }

    fn ids(batch: &Batch) -> Vec<String> {
        batch.events().iter().map(|e| e.id().to_string()).collect()
    }

    fn dead_letter_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with(DEAD_LETTER_PREFIX)
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn write_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;
        let original = event("e1");

        store.write(&original).await.unwrap();
        let batch = store.read_batch().await.unwrap().unwrap();
        assert_eq!(batch.events(), &[original.clone()]);
        assert_eq!(
            serde_json::to_vec(&batch.events()[0]).unwrap(),
            serde_json::to_vec(&original).unwrap()
        );

        batch.commit().await.unwrap();
        assert!(list_event_files(dir.path()).await.unwrap().is_empty());
        assert!(store.read_batch().await.unwrap().is_none());
        assert_eq!(store.total_size(), 0);
    }

    #[tokio::test]
    async fn events_share_a_file_until_rotation() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;
        for id in ["e1", "e2", "e3"] {
            store.write(&event(id)).await.unwrap();
        }

        assert_eq!(list_event_files(dir.path()).await.unwrap().len(), 1);
        let batch = store.read_batch().await.unwrap().unwrap();
        assert_eq!(ids(&batch), vec!["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn rotation_preserves_fifo_across_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(
            dir.path(),
            FileStoreConfig {
                max_file_size: Some(1),
                ..Default::default()
            },
        )
        .await;
        for n in 1..=5 {
            store.write(&event(&format!("e{n}"))).await.unwrap();
        }
        assert_eq!(list_event_files(dir.path()).await.unwrap().len(), 5);

        let mut seen = Vec::new();
        while let Some(batch) = store.read_batch().await.unwrap() {
            assert_eq!(batch.len(), 1);
            seen.extend(ids(&batch));
            batch.commit().await.unwrap();
        }
        assert_eq!(seen, vec!["e1", "e2", "e3", "e4", "e5"]);
    }

    #[tokio::test]
    async fn reading_the_current_file_forces_rotation() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;
        store.write(&event("e1")).await.unwrap();

        let batch = store.read_batch().await.unwrap().unwrap();
        store.write(&event("e2")).await.unwrap();
        assert_eq!(list_event_files(dir.path()).await.unwrap().len(), 2);

        batch.commit().await.unwrap();
        let next = store.read_batch().await.unwrap().unwrap();
        assert_eq!(ids(&next), vec!["e2"]);
    }

    #[tokio::test]
    async fn uncommitted_batch_is_read_again() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;
        store.write(&event("e1")).await.unwrap();
        store.write(&event("e2")).await.unwrap();

        drop(store.read_batch().await.unwrap().unwrap());
        let again = store.read_batch().await.unwrap().unwrap();
        assert_eq!(ids(&again), vec!["e1", "e2"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_and_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let buffer = dir.path().join("buffer");
        let store = store_in(&buffer, FileStoreConfig::default()).await;
        store.write(&event("e1")).await.unwrap();

        let dir_mode = std::fs::metadata(&buffer).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file = &list_event_files(&buffer).await.unwrap()[0];
        let file_mode = std::fs::metadata(file).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn total_size_limit_applies_backpressure() {
        let dir = TempDir::new().unwrap();
        let line_len = serde_json::to_vec(&event("e1")).unwrap().len() as u64 + 1;
        let store = store_in(
            dir.path(),
            FileStoreConfig {
                max_total_size: Some(line_len * 2),
                ..Default::default()
            },
        )
        .await;

        store.write(&event("e1")).await.unwrap();
        store.write(&event("e2")).await.unwrap();
        let err = store.write(&event("e3")).await.unwrap_err();
        assert!(err.is_store_full());
        assert_eq!(store.metrics.error_count(StoreOp::WriteFull), 1);

        let batch = store.read_batch().await.unwrap().unwrap();
        batch.commit().await.unwrap();
        store.write(&event("e3")).await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_lines_go_to_dead_letter() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;
        store.write(&event("e1")).await.unwrap();

        let source = list_event_files(dir.path()).await.unwrap().remove(0);
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&source)
                .unwrap();
            file.write_all(b"{\"id\": \"broken\n").unwrap();
        }
        store.write(&event("e2")).await.unwrap();

        let batch = store.read_batch().await.unwrap().unwrap();
        assert_eq!(ids(&batch), vec!["e1", "e2"]);
        assert_eq!(store.metrics.error_count(StoreOp::CorruptedEvent), 1);

        let dead_letters = dead_letter_files(dir.path());
        assert_eq!(dead_letters.len(), 1);
        let content = std::fs::read_to_string(&dead_letters[0]).unwrap();
        let entry: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(entry["raw_data"], json!("{\"id\": \"broken"));
        assert_eq!(
            entry["source_file"],
            json!(source.file_name().unwrap().to_string_lossy())
        );
        assert!(entry["timestamp"].is_string());
        assert!(entry["error"].as_str().unwrap().contains("unmarshal"));

        batch.commit().await.unwrap();
        assert!(!source.exists());
        assert!(store.read_batch().await.unwrap().is_none());
        assert_eq!(dead_letter_files(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn corrupted_lines_are_dead_lettered_once_across_rereads() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;
        store.write(&event("e1")).await.unwrap();

        let source = list_event_files(dir.path()).await.unwrap().remove(0);
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&source)
                .unwrap();
            file.write_all(b"{broken\n").unwrap();
        }
        store.update_metrics().await.unwrap();
        let clean_size = serde_json::to_vec(&event("e1")).unwrap().len() as u64 + 1;

        for _ in 0..5 {
            let batch = store.read_batch().await.unwrap().unwrap();
            assert_eq!(ids(&batch), vec!["e1"]);
        }

        assert_eq!(dead_letter_files(dir.path()).len(), 1);
        assert_eq!(store.metrics.error_count(StoreOp::CorruptedEvent), 1);
        assert_eq!(std::fs::metadata(&source).unwrap().len(), clean_size);
        assert_eq!(store.total_size(), clean_size);
        assert_eq!(list_event_files(dir.path()).await.unwrap(), vec![source]);
    }

    #[tokio::test]
    async fn fully_corrupted_file_is_removed_and_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;

        let broken = dir.path().join(format!("{EVENT_FILE_PREFIX}{:020}{FILE_SUFFIX}", 1));
        std::fs::write(&broken, b"garbage\nmore garbage\n").unwrap();
        store.write(&event("e1")).await.unwrap();

        let batch = store.read_batch().await.unwrap().unwrap();
        assert_eq!(ids(&batch), vec!["e1"]);
        assert!(!broken.exists());
        assert_eq!(store.metrics.error_count(StoreOp::CorruptedEvent), 2);
        assert_eq!(dead_letter_files(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn update_metrics_reconciles_cached_size() {
        let dir = TempDir::new().unwrap();
        let store = store_in(dir.path(), FileStoreConfig::default()).await;
        store.write(&event("e1")).await.unwrap();

        let file = list_event_files(dir.path()).await.unwrap().remove(0);
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            f.write_all(b"\n\n\n").unwrap();
        }
        let actual = std::fs::metadata(&file).unwrap().len();
        assert_ne!(store.total_size(), actual);

        store.update_metrics().await.unwrap();
        assert_eq!(store.total_size(), actual);
        assert_eq!(store.metrics.size.get(), actual as i64);
        assert_eq!(store.metrics.files.as_ref().unwrap().get(), 1);
    }

    #[tokio::test]
    async fn restart_resumes_existing_files() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(dir.path(), FileStoreConfig::default()).await;
            store.write(&event("e1")).await.unwrap();
            store.write(&event("e2")).await.unwrap();
            store.close().await.unwrap();
        }

        let reopened = store_in(dir.path(), FileStoreConfig::default()).await;
        assert!(reopened.total_size() > 0);
        reopened.write(&event("e3")).await.unwrap();

        let mut seen = Vec::new();
        while let Some(batch) = reopened.read_batch().await.unwrap() {
            seen.extend(ids(&batch));
            batch.commit().await.unwrap();
        }
        assert_eq!(seen, vec!["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn missing_directory_is_a_config_error() {
        let result = FileBackingStore::init(FileStoreConfig::default(), &Registry::new()).await;
        assert!(matches!(result, Err(AuditError::InvalidConfig { .. })));
    }

    #[test]
    fn dead_letter_files_are_not_event_files() {
        assert!(is_event_file_name("audit-events-00000000000000000001.jsonl"));
        assert!(!is_event_file_name(
            "audit-events-deadletter-00000000000000000001.jsonl"
        ));
        assert!(!is_event_file_name("audit-events-1.json"));
        assert!(!is_event_file_name("other.jsonl"));
        assert_eq!(
            stamp_of(Path::new("/x/audit-events-00000000000000000042.jsonl")),
            Some(42)
        );
    }

    #[test]
    fn stamps_are_strictly_increasing() {
        let mut state = FileState {
            current_file: None,
            last_stamp: u128::from(u64::MAX),
        };
        let first = state.next_stamp();
        let second = state.next_stamp();
        assert!(second > first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            store_in(
                dir.path(),
                FileStoreConfig {
                    max_file_size: Some(2048),
                    ..Default::default()
                },
            )
            .await,
        );

        let mut tasks = Vec::new();
        for writer in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    store.write(&event(&format!("w{writer}-{n}"))).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(batch) = store.read_batch().await.unwrap() {
            seen.extend(ids(&batch));
            batch.commit().await.unwrap();
        }
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(total, 200);
        assert_eq!(seen.len(), 200);
    }
}
