//! Structured JSONL logging for controller decisions.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required and optional fields.
//! - [`LogEmitter`]: writes records to a file, any writer, or a shared
//!   in-memory buffer.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks, including
//!   the explainability contract for decision events.
//!
//! Simulations never log: the simulation driver has no handle on an emitter.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Events that record a decision and must carry `policy` and `value`.
pub const DECISION_EVENTS: [&str; 2] = ["policy_selected", "policy_committed"];

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];
const PHASES: [&str; 5] = [
    "idle",
    "updating_predictions",
    "searching",
    "committing",
    "poisoned",
];

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// One controller event, serialized as a single JSONL line.
///
/// `timestamp`, `trace_id`, `level` and `event` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial: Option<u64>,
    /// Controller phase when the event fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Rows scored by the search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluated: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Entry carrying only the mandatory fields.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            controller_id: None,
            trial: None,
            phase: None,
            policy: None,
            row: None,
            value: None,
            outcome: None,
            cost: None,
            evaluated: None,
            error_kind: None,
            duration_ms: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_controller(mut self, controller_id: impl Into<String>) -> Self {
        self.controller_id = Some(controller_id.into());
        self
    }

    #[must_use]
    pub fn with_trial(mut self, trial: u64) -> Self {
        self.trial = Some(trial);
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Attach the decision: chosen row, policy and value.
    #[must_use]
    pub fn with_decision(mut self, row: usize, policy: &[f64], value: f64) -> Self {
        self.row = Some(row);
        self.policy = Some(policy.to_vec());
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: &[f64]) -> Self {
        self.policy = Some(policy.to_vec());
        self
    }

    #[must_use]
    pub fn with_breakdown(mut self, outcome: f64, cost: f64) -> Self {
        self.outcome = Some(outcome);
        self.cost = Some(cost);
        self
    }

    #[must_use]
    pub fn with_evaluated(mut self, evaluated: usize) -> Self {
        self.evaluated = Some(evaluated);
        self
    }

    #[must_use]
    pub fn with_error_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// One JSON object, no newline.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

/// In-memory sink shared between an emitter and its reader.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    /// Everything written so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Non-empty lines written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Writes structured JSONL log entries.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    seq: u64,
    controller_id: String,
    run_id: String,
}

impl std::fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEmitter")
            .field("seq", &self.seq)
            .field("controller_id", &self.controller_id)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl LogEmitter {
    /// Emit into a freshly created file at `path`.
    pub fn to_file(path: &Path, controller_id: &str, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(
            std::io::BufWriter::new(file),
            controller_id,
            run_id,
        ))
    }

    #[must_use]
    pub fn to_writer(
        writer: impl Write + Send + 'static,
        controller_id: &str,
        run_id: &str,
    ) -> Self {
        Self {
            writer: Box::new(writer),
            seq: 0,
            controller_id: controller_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Create an emitter writing to a shared buffer (for testing).
    #[must_use]
    pub fn to_buffer(controller_id: &str, run_id: &str) -> (Self, LogBuffer) {
        let buffer = LogBuffer::default();
        (Self::to_writer(buffer.clone(), controller_id, run_id), buffer)
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{}::{:03}", self.controller_id, self.run_id, self.seq)
    }

    #[must_use]
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Entry pre-filled with the next trace id and the controller id.
    pub fn entry(&mut self, level: LogLevel, event: &str) -> LogEntry {
        let trace_id = self.next_trace_id();
        LogEntry::new(trace_id, level, event).with_controller(&self.controller_id)
    }

    /// Emit a bare entry with auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let entry = self.entry(level, event);
        self.write_line(&entry)?;
        Ok(entry)
    }

    /// Emit a fully-populated entry, filling in missing identity fields.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.controller_id.is_none() {
            entry.controller_id = Some(self.controller_id.clone());
        }
        self.write_line(&entry)
    }

    fn write_line(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

/// Check one log line. `line_number` is 1-based and only used in errors.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field: &str, message: String| {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message,
        });
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            fail("<json>", format!("invalid JSON: {e}"));
            return Err(errors);
        }
    };
    let Some(obj) = value.as_object() else {
        fail("<root>", "expected JSON object".to_string());
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            fail(field, "required field missing".to_string());
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !LEVELS.contains(&level)
    {
        fail("level", format!("invalid level: '{level}'"));
    }

    if let Some(phase) = obj.get("phase").and_then(|v| v.as_str())
        && !PHASES.contains(&phase)
    {
        fail("phase", format!("invalid phase: '{phase}'"));
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && trace_id.split("::").count() != 3
    {
        fail(
            "trace_id",
            format!("trace_id should follow <controller>::<run>::<seq>, got: '{trace_id}'"),
        );
    }

    // Decision explainability: what was chosen and what it was worth.
    if let Some(event) = obj.get("event").and_then(|v| v.as_str())
        && DECISION_EVENTS.contains(&event)
    {
        match obj.get("controller_id").and_then(|v| v.as_str()) {
            Some(c) if !c.trim().is_empty() => {}
            _ => fail(
                "controller_id",
                "decision events must include non-empty controller_id".to_string(),
            ),
        }
        let policy_ok = obj
            .get("policy")
            .and_then(|v| v.as_array())
            .is_some_and(|a| !a.is_empty() && a.iter().all(serde_json::Value::is_number));
        if !policy_ok {
            fail("policy", "decision events must include a numeric policy".to_string());
        }
        if !obj.get("value").is_some_and(serde_json::Value::is_number) {
            fail("value", "decision events must include a numeric value".to_string());
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<entry>".to_string(),
            message: format!("not a log entry: {e}"),
        }]
    })
}

/// Check every non-blank line of a decision log.
///
/// Yields the number of lines checked alongside every problem found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(validate_log_text(&content))
}

/// Validate JSONL text already in memory.
#[must_use]
pub fn validate_log_text(content: &str) -> (usize, Vec<LogValidationError>) {
    let mut problems = Vec::new();
    let mut line_count = 0;
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            problems.extend(errs);
        }
    }
    (line_count, problems)
}

/// Current UTC time as an ISO-8601 string.
#[must_use]
pub fn now_utc() -> String {
    // Approximate calendar fields; no date crate in the stack.
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        1970 + secs / 31_557_600,
        (secs % 31_557_600) / 2_629_800 + 1,
        (secs % 2_629_800) / 86400 + 1,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}
