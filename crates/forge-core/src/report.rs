//! Append-only iteration log.
//!
//! Columns: `timestamp_ms`, kind, iteration, `duration_ms`, tools, `failed_tools`, message
//!
//! The log is an audit trail and is never read back by the engine.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Event kinds written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    RunStart,
    IterationEnd,
    RunComplete,
    RunExhausted,
    RunFailed,
}

impl RowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStart => "RUN_START",
            Self::IterationEnd => "ITERATION_END",
            Self::RunComplete => "RUN_COMPLETE",
            Self::RunExhausted => "RUN_EXHAUSTED",
            Self::RunFailed => "RUN_FAILED",
        }
    }
}

/// A single row in the iteration log.
#[derive(Debug, Clone)]
pub struct IterationRow {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub kind: RowKind,
    pub iteration: Option<u32>,
    pub duration_ms: Option<u64>,
    /// Number of tool results produced in the iteration.
    pub tools: Option<usize>,
    /// Number of those results that failed.
    pub failed_tools: Option<usize>,
    pub message: String,
}

impl IterationRow {
    pub fn new(timestamp_ms: i64, kind: RowKind) -> Self {
        Self {
            timestamp_ms,
            kind,
            iteration: None,
            duration_ms: None,
            tools: None,
            failed_tools: None,
            message: String::new(),
        }
    }

    /// Row stamped with the current wall clock.
    pub fn now(kind: RowKind) -> Self {
        Self::new(chrono::Utc::now().timestamp_millis(), kind)
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Set tool counts.
    pub fn with_tools(mut self, total: usize, failed: usize) -> Self {
        self.tools = Some(total);
        self.failed_tools = Some(failed);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    fn to_tsv_line(&self) -> String {
        let iteration = self.iteration.map(|i| i.to_string()).unwrap_or_default();
        let duration = self.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let tools = self.tools.map(|t| t.to_string()).unwrap_or_default();
        let failed = self.failed_tools.map(|t| t.to_string()).unwrap_or_default();

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.kind.as_str(),
            iteration,
            duration,
            tools,
            failed,
            sanitize_field(&self.message),
        )
    }
}

/// Flatten tabs and line breaks so a message stays in its column.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// First line of every new log file.
pub const HEADER: &str = "timestamp_ms\tkind\titeration\tduration_ms\ttools\tfailed_tools\tmessage";

/// Writer for the iteration log.
pub struct IterationLog {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for IterationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationLog")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl IterationLog {
    /// Open the log for appending, writing the header if the file is new.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    /// Write a row and flush it to disk.
    pub fn write_row(&mut self, row: &IterationRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())?;
        self.writer.flush()
    }
}
