//! Update-cycle progress reporting.
//!
//! The updater walks a fixed sequence of phases; reporters turn phase
//! changes and per-file loading counts into output on **stderr**, so stdout
//! stays parseable for scripts.

use serde::Serialize;
use std::io::Write;

/// Phase of an update cycle.
///
/// A cycle runs `Scanning → Detecting → Loading → Chunking → Indexing →
/// Persisting` and returns to `Idle`. A cycle with no changes goes from
/// `Detecting` straight back to `Idle`; any failure passes through `Error`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Scanning,
    Detecting,
    Loading,
    Chunking,
    Indexing,
    Persisting,
    Error,
}

impl UpdatePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Scanning => "scanning",
            UpdatePhase::Detecting => "detecting",
            UpdatePhase::Loading => "loading",
            UpdatePhase::Chunking => "chunking",
            UpdatePhase::Indexing => "indexing",
            UpdatePhase::Persisting => "persisting",
            UpdatePhase::Error => "error",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateProgressEvent {
    /// The cycle entered a new phase.
    Phase(UpdatePhase),
    /// Loading: n files processed out of total.
    Loading { n: u64, total: u64 },
    /// Indexing: chunks about to be embedded.
    Embedding { chunks: u64 },
}

pub trait UpdateProgressReporter: Send + Sync {
    fn report(&self, event: UpdateProgressEvent);
}

/// Human-friendly progress on stderr: "update  loading  12 / 1,034 files".
pub struct StderrProgress;

impl UpdateProgressReporter for StderrProgress {
    fn report(&self, event: UpdateProgressEvent) {
        let line = match &event {
            UpdateProgressEvent::Phase(UpdatePhase::Idle) => return,
            UpdateProgressEvent::Phase(phase) => format!("update  {}...\n", phase.as_str()),
            UpdateProgressEvent::Loading { n, total } => format!(
                "update  loading  {} / {} files\n",
                format_number(*n),
                format_number(*total)
            ),
            UpdateProgressEvent::Embedding { chunks } => {
                format!("update  embedding {} chunks\n", format_number(*chunks))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl UpdateProgressReporter for JsonProgress {
    fn report(&self, event: UpdateProgressEvent) {
        let obj = match &event {
            UpdateProgressEvent::Phase(phase) => serde_json::json!({
                "event": "progress",
                "phase": phase,
            }),
            UpdateProgressEvent::Loading { n, total } => serde_json::json!({
                "event": "progress",
                "phase": UpdatePhase::Loading,
                "n": n,
                "total": total
            }),
            UpdateProgressEvent::Embedding { chunks } => serde_json::json!({
                "event": "progress",
                "phase": UpdatePhase::Indexing,
                "chunks": chunks
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl UpdateProgressReporter for NoProgress {
    fn report(&self, _event: UpdateProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn UpdateProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn phase_names_are_snake_case() {
        assert_eq!(
            serde_json::to_value(UpdatePhase::Persisting).unwrap(),
            "persisting"
        );
        assert_eq!(UpdatePhase::Idle.as_str(), "idle");
    }
}
