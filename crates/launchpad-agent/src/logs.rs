use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::config::AgentConfig;

/// Bounded, sequence-numbered ring of output lines for one project.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Returns up to `limit` lines after `cursor` and the cursor to resume from.
    ///
    /// Cursor 0 reads the newest page. A cursor older than the retained window
    /// resumes at the oldest line still held; an up-to-date cursor comes back
    /// unchanged with no lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let start = match cursor {
            0 => self.lines.len().saturating_sub(limit),
            c => self.lines.partition_point(|(seq, _)| *seq <= c),
        };
        let page: Vec<&(u64, String)> = self.lines.range(start..).take(limit).collect();
        let next = page.last().map_or(cursor, |(seq, _)| *seq);
        (page.into_iter().map(|(_, line)| line.clone()).collect(), next)
    }

    /// Cursor pointing at the newest line, for "only what comes after now" reads.
    pub fn cursor(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Last `n` application output lines joined for an error message.
    pub fn diagnostic_after(&self, cursor: u64, n: usize) -> Option<String> {
        let picked: Vec<&str> = self
            .lines
            .iter()
            .filter(|(seq, line)| *seq > cursor && !line.starts_with("[launchpad]"))
            .map(|(_, line)| line.as_str())
            .collect();
        if picked.is_empty() {
            return None;
        }
        let start = picked.len().saturating_sub(n);
        Some(picked[start..].join("\n"))
    }
}

#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub fn new(buffer: Arc<Mutex<LogBuffer>>, file_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self { buffer, file_tx }
    }

    pub fn buffer(&self) -> Arc<Mutex<LogBuffer>> {
        self.buffer.clone()
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    /// Copies `reader` line by line into the sink, prefixed with `tag`.
    /// The task ends at EOF.
    pub fn pipe<R>(&self, tag: &'static str, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.emit(format!("[{tag}] {line}")).await;
            }
        })
    }
}

/// One [`LogSink`] per project, shared by preparation and runs so that a
/// project's output reads as a single stream across relaunches.
#[derive(Clone)]
pub struct ProjectLogs {
    envs_root: PathBuf,
    max_lines: usize,
    file_max_bytes: u64,
    file_max_files: usize,
    sinks: Arc<std::sync::Mutex<HashMap<String, LogSink>>>,
}

impl ProjectLogs {
    pub fn new(
        envs_root: impl Into<PathBuf>,
        max_lines: usize,
        file_max_bytes: u64,
        file_max_files: usize,
    ) -> Self {
        Self {
            envs_root: envs_root.into(),
            max_lines,
            file_max_bytes,
            file_max_files,
            sinks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self::new(
            cfg.envs_root(),
            cfg.log_max_lines,
            cfg.log_file_max_bytes,
            cfg.log_file_max_files,
        )
    }

    pub fn console_path(&self, project_id: &str) -> PathBuf {
        console_path(&self.envs_root.join(project_id))
    }

    /// Returns the project's sink, creating it (and its file writer) on first use.
    /// Must be called from within a tokio runtime.
    pub fn sink(&self, project_id: &str) -> LogSink {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = sinks.get(project_id) {
            return s.clone();
        }
        let file_tx = spawn_file_writer(
            self.console_path(project_id),
            self.file_max_bytes,
            self.file_max_files,
        );
        let sink = LogSink::new(
            Arc::new(Mutex::new(LogBuffer::new(self.max_lines))),
            Some(file_tx),
        );
        sinks.insert(project_id.to_string(), sink.clone());
        sink
    }

    pub fn get(&self, project_id: &str) -> Option<LogSink> {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.get(project_id).cloned()
    }

    /// Drops the project's sink; its file writer exits once the last clone is gone.
    pub fn forget(&self, project_id: &str) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.remove(project_id);
    }
}

pub fn console_path(env_dir: &Path) -> PathBuf {
    env_dir.join("logs").join("console.log")
}

struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        // Shift old rotations: .(n-1) -> .n
        for i in (1..self.max_files).rev() {
            let from = PathBuf::from(format!("{}.{}", self.path.display(), i));
            let to = PathBuf::from(format!("{}.{}", self.path.display(), i + 1));
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, to).await;
            }
        }

        let rotated = PathBuf::from(format!("{}.1", self.path.display()));
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, &rotated).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

/// Starts a background writer appending lines to `path` with size-based rotation.
pub fn spawn_file_writer(
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut writer = match FileLogWriter::open(path.clone(), max_bytes, max_files).await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "console log unavailable");
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            let _ = writer.write_line(&line).await;
        }
        let _ = writer.file.flush().await;
    });
    tx
}
