use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use super::parser::StdoutParser;
use super::{Error, Result};
use crate::alarm::{self, AlarmType};
use crate::checkpoint::{CheckpointRecord, FileState};
use crate::config::StdoutConfig;
use crate::fsutil;
use crate::metrics::{self, Counter, Gauge, Latency, MetricsRegistry};
use crate::shutdown::Shutdown;

/// Staleness hint that forces the parser to flush whatever it holds.
const FORCE_FLUSH: Duration = Duration::from_secs(3600);
/// Files modified more recently than this are read from (close to) their start.
const READ_FROM_START_WINDOW: Duration = Duration::from_secs(180);
const TRUNCATE_RESTART_LIMIT: i64 = 10 * 1024 * 1024;
const TRUNCATE_REWIND: i64 = 1024 * 1024;
const MAX_READS_PER_TICK: usize = 64;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub read_interval: Duration,
    /// The file handle is released after this long without new bytes.
    pub close_unchanged: Duration,
    /// At most this many trailing bytes of a fresh file are read.
    pub start_log_max_offset: u64,
    pub max_block_size: usize,
}

impl From<&StdoutConfig> for ReaderOptions {
    fn from(config: &StdoutConfig) -> Self {
        Self {
            read_interval: Duration::from_millis(config.read_interval_ms),
            close_unchanged: Duration::from_secs(config.close_un_changed_sec),
            start_log_max_offset: config.start_log_max_offset,
            max_block_size: config.max_read_block_size,
        }
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::from(&StdoutConfig::default())
    }
}

/// Per reader metrics.
#[derive(Debug, Clone, Default)]
pub struct ReaderMetrics {
    pub open_count: Arc<Counter>,
    pub close_count: Arc<Counter>,
    pub file_size: Arc<Gauge>,
    pub file_rotate: Arc<Counter>,
    pub read_count: Arc<Counter>,
    pub read_size: Arc<Counter>,
    pub process_latency: Arc<Latency>,
}

impl ReaderMetrics {
    pub fn register(registry: &MetricsRegistry, labels: &[(&str, &str)]) -> Self {
        Self {
            open_count: registry.counter(metrics::OPEN_COUNT, labels),
            close_count: registry.counter(metrics::CLOSE_COUNT, labels),
            file_size: registry.gauge(metrics::FILE_SIZE, labels),
            file_rotate: registry.counter(metrics::FILE_ROTATE, labels),
            read_count: registry.counter(metrics::READ_COUNT, labels),
            read_size: registry.counter(metrics::READ_SIZE, labels),
            process_latency: registry.latency(metrics::LOG_PROCESS_LATENCY, labels),
        }
    }
}

#[derive(Debug, Default)]
struct CheckpointSlot {
    record: CheckpointRecord,
    changed: bool,
}

/// Shared view of a reader's checkpoint.
///
/// The reader publishes into it after every tick; the owning service takes it to persist.
#[derive(Debug, Clone, Default)]
pub struct CheckpointHandle {
    inner: Arc<Mutex<CheckpointSlot>>,
}

impl CheckpointHandle {
    fn new(record: CheckpointRecord) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CheckpointSlot {
                record,
                changed: true,
            })),
        }
    }

    /// Returns the current record and whether it changed since the last call.
    pub fn take(&self) -> (CheckpointRecord, bool) {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = std::mem::take(&mut slot.changed);
        (slot.record.clone(), changed)
    }

    pub fn get(&self) -> CheckpointRecord {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record
            .clone()
    }

    fn publish(&self, offset: i64, state: FileState) {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.record.offset != offset || slot.record.state != state {
            slot.record.offset = offset;
            slot.record.state = state;
            slot.changed = true;
        }
    }
}

/// Tails one container's stdout log file and feeds it to a [`StdoutParser`].
///
/// All methods except [`FileReader::run`] block on file I/O.
pub struct FileReader {
    path: PathBuf,
    file: Option<File>,
    /// Bytes read past `offset` that the parser has not consumed yet.
    buffer: Vec<u8>,
    offset: i64,
    state: FileState,
    last_data: Instant,
    parser: StdoutParser,
    options: ReaderOptions,
    metrics: ReaderMetrics,
    checkpoint: CheckpointHandle,
}

impl FileReader {
    /// Creates a reader of `path`, resuming from `saved` if it refers to the same path.
    pub fn new(
        path: PathBuf,
        saved: Option<CheckpointRecord>,
        parser: StdoutParser,
        options: ReaderOptions,
        metrics: ReaderMetrics,
    ) -> Self {
        let path_name = path.to_string_lossy().into_owned();
        let record = match saved {
            Some(record) if record.path == path_name => {
                log::info!(
                    "resuming `{}` at offset {} (inode {})",
                    path_name,
                    record.offset,
                    record.state.inode
                );
                record
            }
            Some(record) => {
                log::info!(
                    "checkpoint of `{}` refers to `{}`, starting fresh",
                    path_name,
                    record.path
                );
                fresh_record(&path, options.start_log_max_offset)
            }
            None => fresh_record(&path, options.start_log_max_offset),
        };
        Self {
            path,
            file: None,
            buffer: Vec::with_capacity(options.max_block_size.min(64 * 1024)),
            offset: record.offset,
            state: record.state,
            last_data: Instant::now(),
            parser,
            options,
            metrics,
            checkpoint: CheckpointHandle::new(record),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint_handle(&self) -> CheckpointHandle {
        self.checkpoint.clone()
    }

    /// Runs one read iteration: detects rotation and truncation, reads what is available and
    /// hands complete lines to the parser.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stat`], [`Error::OpenFile`] or [`Error::Read`]; the reader stays usable.
    pub fn tick(&mut self) -> Result<()> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(source) => {
                self.close_file();
                return Err(Error::Stat {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let current = FileState::from_metadata(&metadata);
        self.metrics.file_size.set(current.size);

        if !self.state.is_empty() && !self.state.same_file(&current) {
            log::info!(
                "`{}` rotated, inode {} -> {}",
                self.path.display(),
                self.state.inode,
                current.inode
            );
            self.drain();
            self.metrics.file_rotate.add(1);
            self.reset(0, current);
            return Ok(());
        }
        if current.size < self.offset {
            let offset = if current.size < TRUNCATE_RESTART_LIMIT {
                0
            } else {
                current.size - TRUNCATE_REWIND
            };
            log::info!(
                "`{}` truncated to {} bytes, offset {} -> {}",
                self.path.display(),
                current.size,
                self.offset,
                offset
            );
            self.drain();
            self.metrics.file_rotate.add(1);
            self.reset(offset, current);
            return Ok(());
        }
        self.state = current;

        let started = Instant::now();
        let mut produced = false;
        for _ in 0..MAX_READS_PER_TICK {
            if self.read_once(current.size)? == 0 {
                break;
            }
            produced = true;
            self.last_data = Instant::now();
            self.process_buffer(Duration::ZERO);
        }
        if produced {
            self.metrics.process_latency.observe(started.elapsed());
        } else {
            self.process_buffer(self.last_data.elapsed());
            if self.file.is_some() && self.last_data.elapsed() > self.options.close_unchanged {
                log::debug!("closing idle `{}`", self.path.display());
                self.close_file();
            }
        }
        self.publish();
        Ok(())
    }

    /// Flushes everything the parser holds and releases the file.
    pub fn finish(&mut self) {
        let consumed = self.parser.process(&self.buffer, FORCE_FLUSH);
        self.buffer.drain(..consumed);
        self.offset += consumed as i64;
        self.parser.process(&[], FORCE_FLUSH);
        self.close_file();
        self.publish();
    }

    /// Ticks every read interval until `shutdown` fires, then finishes.
    pub async fn run(self, mut shutdown: Shutdown) {
        let name = self.path.display().to_string();
        let interval = self.options.read_interval;
        let mut reader = self;
        loop {
            let ticked = tokio::task::spawn_blocking(move || {
                let outcome = reader.tick();
                (reader, outcome)
            })
            .await;
            match ticked {
                Ok((back, outcome)) => {
                    reader = back;
                    if let Err(err) = outcome {
                        report(&err);
                    }
                }
                Err(err) => {
                    log::error!("reader of `{name}` aborted: {err}");
                    return;
                }
            }
            if !shutdown.sleep(interval).await {
                break;
            }
        }
        if let Err(err) = tokio::task::spawn_blocking(move || reader.finish()).await {
            log::error!("final flush of `{name}` failed: {err}");
        }
    }

    fn read_once(&mut self, size: i64) -> Result<usize> {
        let buffered = self.buffer.len();
        let start = self.offset + buffered as i64;
        let available = usize::try_from(size - start).unwrap_or(0);
        let want = available.min(self.options.max_block_size.saturating_sub(buffered));
        if want == 0 {
            return Ok(0);
        }
        if self.file.is_none() {
            self.file = Some(fsutil::open_file(&self.path)?);
            self.metrics.open_count.add(1);
        }
        let Some(file) = self.file.as_ref() else {
            return Ok(0);
        };

        let start = u64::try_from(start).unwrap_or_default();
        self.buffer.resize(buffered + want, 0);
        let read = read_full_at(file, &mut self.buffer[buffered..], start);
        let read = match read {
            Ok(read) => read,
            Err(source) => {
                self.buffer.truncate(buffered);
                self.close_file();
                return Err(Error::Read {
                    path: self.path.clone(),
                    offset: start,
                    source,
                });
            }
        };
        self.buffer.truncate(buffered + read);
        self.metrics.read_count.add(1);
        self.metrics.read_size.add(read as i64);
        Ok(read)
    }

    /// Parses the buffer up to its last `\n`, or all of it when it is full without one.
    fn process_buffer(&mut self, staleness: Duration) {
        let block_len = match self.buffer.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None if self.buffer.len() >= self.options.max_block_size => self.buffer.len(),
            None => 0,
        };
        let consumed = self.parser.process(&self.buffer[..block_len], staleness);
        self.buffer.drain(..consumed);
        self.offset += consumed as i64;
    }

    /// Hands every buffered byte to the parser and flushes it.
    fn drain(&mut self) {
        while !self.buffer.is_empty() {
            let consumed = self.parser.process(&self.buffer, FORCE_FLUSH);
            if consumed == 0 {
                break;
            }
            self.buffer.drain(..consumed);
        }
        self.buffer.clear();
        self.parser.process(&[], FORCE_FLUSH);
    }

    fn reset(&mut self, offset: i64, state: FileState) {
        self.offset = offset;
        self.state = state;
        self.close_file();
        self.publish();
    }

    fn close_file(&mut self) {
        if self.file.take().is_some() {
            self.metrics.close_count.add(1);
        }
    }

    fn publish(&self) {
        self.checkpoint.publish(self.offset, self.state);
    }
}

/// Initial record for a file without a usable checkpoint.
fn fresh_record(path: &Path, start_log_max_offset: u64) -> CheckpointRecord {
    let mut record = CheckpointRecord::new(path.to_string_lossy());
    match std::fs::metadata(path) {
        Ok(metadata) => {
            let state = FileState::from_metadata(&metadata);
            let recent = metadata.modified().is_ok_and(|modified| {
                SystemTime::now()
                    .duration_since(modified)
                    .map_or(true, |age| age <= READ_FROM_START_WINDOW)
            });
            record.offset = if recent {
                let max = i64::try_from(start_log_max_offset).unwrap_or(i64::MAX);
                (state.size - max).max(0)
            } else {
                state.size
            };
            record.state = state;
        }
        Err(err) => log::warn!(
            "stat `{}` failed, reading from its start once it appears: {}",
            path.display(),
            err
        ),
    }
    record
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn report(err: &Error) {
    match err {
        Error::Stat { .. } => alarm::raise(AlarmType::StatFile, format_args!("{err}")),
        Error::Read { .. } | Error::OpenFile(_) => {
            alarm::raise(AlarmType::ReadFile, format_args!("{err}"))
        }
        other => log::warn!("{other}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;

    use super::*;
    use crate::stdout::collector::PipelineContext;
    use crate::stdout::collector::testing::MemoryCollector;
    use crate::stdout::parser::ParserOptions;

    const TIME: &str = "2021-07-13T16:32:21.212861448Z";

    fn cri(tag: char, content: &str) -> String {
        format!("{TIME} stdout {tag} {content}\n")
    }

    fn reader(
        path: &Path,
        options: ReaderOptions,
        saved: Option<CheckpointRecord>,
    ) -> (FileReader, MemoryCollector, ReaderMetrics) {
        let collector = MemoryCollector::default();
        let parser = StdoutParser::new(
            ParserOptions::default(),
            PipelineContext::default(),
            Arc::new(collector.clone()),
            BTreeMap::new(),
        );
        let metrics = ReaderMetrics::default();
        let reader = FileReader::new(
            path.to_path_buf(),
            saved,
            parser,
            options,
            metrics.clone(),
        );
        (reader, collector, metrics)
    }

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    #[test]
    fn test_reads_complete_lines_and_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        let lines = format!("{}{}", cri('F', "a"), cri('F', "b"));
        std::fs::write(&path, format!("{lines}{TIME} stdout F c")).unwrap();

        let (mut reader, collector, metrics) = reader(&path, ReaderOptions::default(), None);
        reader.tick().unwrap();
        assert_eq!(collector.contents(), vec!["a", "b"]);
        let (record, changed) = reader.checkpoint_handle().take();
        assert!(changed);
        assert_eq!(record.offset, lines.len() as i64);
        assert_eq!(metrics.open_count.get(), 1);
        assert_eq!(metrics.read_count.get(), 1);

        append(&path, "\n");
        reader.tick().unwrap();
        assert_eq!(collector.contents(), vec!["a", "b", "c"]);
        let size = std::fs::metadata(&path).unwrap().len() as i64;
        assert_eq!(reader.checkpoint_handle().take().0.offset, size);

        reader.tick().unwrap();
        assert!(!reader.checkpoint_handle().take().1);
    }

    #[test]
    fn test_rotation_flushes_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.log");
        let first = cri('P', &"x".repeat(59));
        assert_eq!(first.len(), 100);
        std::fs::write(&path, &first).unwrap();

        let (mut reader, collector, metrics) = reader(&path, ReaderOptions::default(), None);
        reader.tick().unwrap();
        assert!(collector.records().is_empty());
        let before = reader.checkpoint_handle().get();
        assert_eq!(before.offset, 100);

        let second = cri('F', "123456789");
        assert_eq!(second.len(), 50);
        let replacement = dir.path().join("b.log.new");
        std::fs::write(&replacement, &second).unwrap();
        std::fs::rename(&replacement, &path).unwrap();

        reader.tick().unwrap();
        assert_eq!(collector.contents(), vec!["x".repeat(59)]);
        assert_eq!(metrics.file_rotate.get(), 1);
        let after = reader.checkpoint_handle().get();
        assert_eq!(after.offset, 0);
        assert_eq!(after.state.size, 50);
        assert_ne!(after.state.inode, before.state.inode);

        reader.tick().unwrap();
        assert_eq!(collector.contents()[1], "123456789");
        assert_eq!(reader.checkpoint_handle().get().offset, 50);
    }

    #[test]
    fn test_truncation_restarts_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        std::fs::write(&path, cri('F', "first").repeat(4)).unwrap();

        let (mut reader, collector, metrics) = reader(&path, ReaderOptions::default(), None);
        reader.tick().unwrap();
        assert_eq!(collector.records().len(), 4);
        assert_eq!(metrics.file_rotate.get(), 0);

        std::fs::write(&path, cri('F', "z")).unwrap();
        reader.tick().unwrap();
        assert_eq!(reader.checkpoint_handle().get().offset, 0);
        assert_eq!(metrics.file_rotate.get(), 1);
        reader.tick().unwrap();
        assert_eq!(collector.contents().last().map(String::as_str), Some("z"));
    }

    #[test]
    fn test_fresh_reader_skips_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.log");
        std::fs::write(&path, cri('F', "history")).unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        drop(file);

        let (mut reader, collector, _) = reader(&path, ReaderOptions::default(), None);
        let size = std::fs::metadata(&path).unwrap().len() as i64;
        assert_eq!(reader.checkpoint_handle().take().0.offset, size);
        append(&path, &cri('F', "new"));
        reader.tick().unwrap();
        assert_eq!(collector.contents(), vec!["new"]);
    }

    #[test]
    fn test_start_log_max_offset_bounds_fresh_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let line = cri('F', "line");
        std::fs::write(&path, line.repeat(10)).unwrap();

        let options = ReaderOptions {
            start_log_max_offset: (line.len() * 2) as u64,
            ..Default::default()
        };
        let (mut reader, collector, _) = reader(&path, options, None);
        assert_eq!(
            reader.checkpoint_handle().get().offset,
            (line.len() * 8) as i64
        );
        reader.tick().unwrap();
        assert_eq!(collector.contents(), vec!["line", "line"]);
    }

    #[test]
    fn test_resume_from_saved_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.log");
        let line = cri('F', "seen");
        std::fs::write(&path, format!("{line}{}", cri('F', "unseen"))).unwrap();
        let state = FileState::from_metadata(&std::fs::metadata(&path).unwrap());
        let saved = CheckpointRecord {
            path: path.to_string_lossy().into_owned(),
            offset: line.len() as i64,
            state,
        };

        let (mut reader, collector, _) = reader(&path, ReaderOptions::default(), Some(saved));
        reader.tick().unwrap();
        assert_eq!(collector.contents(), vec!["unseen"]);

        let other = CheckpointRecord {
            path: "/elsewhere.log".to_owned(),
            offset: 3,
            state,
        };
        let (reader, _, _) = self::reader(&path, ReaderOptions::default(), Some(other));
        assert_eq!(reader.checkpoint_handle().get().offset, 0);
    }

    #[test]
    fn test_finish_flushes_pending_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.log");
        std::fs::write(&path, cri('P', "dangling")).unwrap();

        let (mut reader, collector, metrics) = reader(&path, ReaderOptions::default(), None);
        reader.tick().unwrap();
        assert!(collector.records().is_empty());
        reader.finish();
        assert_eq!(collector.contents(), vec!["dangling"]);
        assert_eq!(metrics.close_count.get(), 1);
    }

    #[test]
    fn test_oversized_line_is_emitted_in_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.log");
        std::fs::write(&path, "y".repeat(40)).unwrap();

        let options = ReaderOptions {
            max_block_size: 16,
            ..Default::default()
        };
        let (mut reader, collector, _) = reader(&path, options, None);
        reader.tick().unwrap();
        assert_eq!(collector.contents(), vec!["y".repeat(16), "y".repeat(16)]);
        assert_eq!(reader.checkpoint_handle().get().offset, 32);
    }

    #[test]
    fn test_missing_file_reports_stat_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.log");
        let (mut reader, _, _) = reader(&path, ReaderOptions::default(), None);
        assert!(matches!(reader.tick(), Err(Error::Stat { .. })));

        let line = cri('F', "late");
        std::fs::write(&path, &line).unwrap();
        reader.tick().unwrap();
        assert_eq!(reader.checkpoint_handle().get().offset, line.len() as i64);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        std::fs::write(&path, cri('P', "tail")).unwrap();
        let options = ReaderOptions {
            read_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (reader, collector, _) = reader(&path, options, None);
        let handle = reader.checkpoint_handle();
        let (trigger, shutdown) = crate::shutdown::channel();
        let task = tokio::spawn(reader.run(shutdown));
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
        task.await.unwrap();
        assert_eq!(collector.contents(), vec!["tail"]);
        assert_eq!(handle.get().offset, cri('P', "tail").len() as i64);
    }
}
