use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const MAX_LOG_SIZE: u64 = 50 * 1024 * 1024;
pub const TRUNCATE_TO_SIZE: u64 = 25 * 1024 * 1024;

/// Plain-text sink for the client's output, kept apart from the service's own tracing output.
///
/// Writes never fail the caller; a sink that cannot be opened simply drops lines.
#[derive(Debug)]
pub struct ClientLog {
    path: PathBuf,
    max_size: u64,
    truncate_to: u64,
    inner: Mutex<Sink>,
}

#[derive(Debug)]
struct Sink {
    file: Option<File>,
    size: u64,
}

impl ClientLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_limits(path, MAX_LOG_SIZE, TRUNCATE_TO_SIZE)
    }

    pub fn with_limits(path: impl Into<PathBuf>, max_size: u64, truncate_to: u64) -> Self {
        let path = path.into();
        let sink = Sink {
            file: open_append(&path),
            size: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
        };
        Self {
            path,
            max_size,
            truncate_to,
            inner: Mutex::new(sink),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn output(&self, message: &str) {
        self.log("OUT", message);
    }

    pub fn error(&self, message: &str) {
        self.log("ERR", message);
    }

    pub fn info(&self, message: &str) {
        self.log("INFO", message);
    }

    pub fn log(&self, level: &str, message: &str) {
        let Ok(mut sink) = self.inner.lock() else {
            return;
        };
        let Some(file) = sink.file.as_mut() else {
            return;
        };

        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message
        );
        if file.write_all(line.as_bytes()).is_err() {
            return;
        }
        sink.size += line.len() as u64;

        if sink.size >= self.max_size {
            self.truncate(&mut sink);
        }
    }

    /// Keeps only the newest lines that fit in `truncate_to` bytes.
    fn truncate(&self, sink: &mut Sink) {
        sink.file = None;

        let kept = fs::read_to_string(&self.path).ok().map(|content| {
            let lines: Vec<&str> = content.lines().collect();
            let mut total = 0u64;
            let mut start = lines.len();
            for (i, line) in lines.iter().enumerate().rev() {
                total += line.len() as u64 + 1;
                if total > self.truncate_to {
                    break;
                }
                start = i;
            }
            lines[start..]
                .iter()
                .map(|line| format!("{}\n", line))
                .collect::<String>()
        });

        match kept {
            Some(kept) if fs::write(&self.path, &kept).is_ok() => {
                sink.size = kept.len() as u64;
            }
            _ => {
                let _ = fs::remove_file(&self.path);
                sink.size = 0;
            }
        }
        sink.file = open_append(&self.path);
    }
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}
