//! Experiment recorder
//!
//! One directory per run holding `meta.json`, `script.yaml`, five JSONL
//! streams and a final `vars_snapshot.json`. Every record carries `ts`, the
//! wall-clock time in Unix seconds. Writes before `start` or after `close`
//! are ignored.

use crate::core::value::{Args, Value, Variables};
use chrono::{DateTime, Local, Utc};
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Recorder error types
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Filesystem failure
    #[error("recorder I/O error at {}: {source}", .path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded
    #[error("recorder encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RecorderError + '_ {
    move |source| RecorderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where and under which name a run is recorded
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderOptions {
    /// Parent of the run directory
    pub base_dir: PathBuf,
    /// Run name; sanitized into the directory name
    pub name: String,
    /// Script source to snapshot
    pub script_text: Option<String>,
    /// Script path, recorded in meta and read when no text is given
    pub script_path: Option<PathBuf>,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("logs/experiments"),
            name: "run".into(),
            script_text: None,
            script_path: None,
        }
    }
}

/// Files of one recorded run
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderPaths {
    /// Run directory
    pub root: PathBuf,
    /// Run metadata
    pub meta: PathBuf,
    /// Script snapshot
    pub script: PathBuf,
    /// Log records
    pub logs: PathBuf,
    /// State entries
    pub states: PathBuf,
    /// Events
    pub events: PathBuf,
    /// Action attempts and outcomes
    pub actions: PathBuf,
    /// Chart points
    pub charts: PathBuf,
    /// Final variables
    pub vars_snapshot: PathBuf,
}

impl RecorderPaths {
    fn new(root: PathBuf) -> Self {
        Self {
            meta: root.join("meta.json"),
            script: root.join("script.yaml"),
            logs: root.join("logs.jsonl"),
            states: root.join("states.jsonl"),
            events: root.join("events.jsonl"),
            actions: root.join("actions.jsonl"),
            charts: root.join("charts.jsonl"),
            vars_snapshot: root.join("vars_snapshot.json"),
            root,
        }
    }
}

struct Stream {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Stream {
    fn create(path: PathBuf) -> Result<Self, RecorderError> {
        let file = File::create(&path).map_err(io_err(&path))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, record: &serde_json::Value) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).map_err(io_err(&self.path))?;
        self.writer.flush().map_err(io_err(&self.path))
    }
}

struct Streams {
    logs: Stream,
    states: Stream,
    events: Stream,
    actions: Stream,
    charts: Stream,
}

/// Outcome written to the action stream
pub enum ActionOutcome<'a> {
    /// Action returned a value
    Ok(&'a Value),
    /// Action failed
    Err {
        /// Error class name
        kind: &'a str,
        /// Error message
        message: String,
    },
}

/// Append-only JSONL audit trail for one run
pub struct ExperimentRecorder {
    options: RecorderOptions,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    paths: Option<RecorderPaths>,
    streams: Option<Streams>,
    closed: bool,
}

impl ExperimentRecorder {
    /// Create a recorder; nothing touches the filesystem until [`start`](Self::start)
    pub fn new(options: RecorderOptions) -> Self {
        Self {
            options,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            paths: None,
            streams: None,
            closed: false,
        }
    }

    /// Run identifier written to `meta.json`
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Run directory once started
    pub fn root(&self) -> Option<&Path> {
        self.paths.as_ref().map(|p| p.root.as_path())
    }

    /// Paths once started
    pub fn paths(&self) -> Option<&RecorderPaths> {
        self.paths.as_ref()
    }

    /// Started and not yet closed
    pub fn is_active(&self) -> bool {
        self.streams.is_some()
    }

    /// Create the run directory, write meta and script, open the streams
    pub fn start(&mut self) -> Result<PathBuf, RecorderError> {
        if let Some(paths) = &self.paths {
            return Ok(paths.root.clone());
        }
        self.started_at = Utc::now();
        let root = unique_dir(
            &self.options.base_dir,
            &format!(
                "{}_{}",
                self.started_at.with_timezone(&Local).format("%Y%m%d_%H%M%S"),
                sanitize_name(&self.options.name)
            ),
        );
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        let paths = RecorderPaths::new(root);

        self.write_meta(&paths)?;
        self.write_script(&paths)?;
        self.streams = Some(Streams {
            logs: Stream::create(paths.logs.clone())?,
            states: Stream::create(paths.states.clone())?,
            events: Stream::create(paths.events.clone())?,
            actions: Stream::create(paths.actions.clone())?,
            charts: Stream::create(paths.charts.clone())?,
        });
        tracing::info!(dir = %paths.root.display(), run_id = %self.run_id, "recorder started");
        let root = paths.root.clone();
        self.paths = Some(paths);
        Ok(root)
    }

    fn write_meta(&self, paths: &RecorderPaths) -> Result<(), RecorderError> {
        let meta = json!({
            "run_id": self.run_id.to_string(),
            "name": self.options.name,
            "started_at": unix_seconds(self.started_at),
            "started_at_iso": self.started_at.to_rfc3339(),
            "environment": {
                "crate": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "family": std::env::consts::FAMILY,
            },
            "script": {
                "path": self.options.script_path.as_ref().map(|p| p.display().to_string()),
            },
        });
        let text = serde_json::to_string_pretty(&meta)?;
        fs::write(&paths.meta, text).map_err(io_err(&paths.meta))
    }

    fn write_script(&self, paths: &RecorderPaths) -> Result<(), RecorderError> {
        let text = match (&self.options.script_text, &self.options.script_path) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => fs::read_to_string(path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "script snapshot unavailable");
                "# script unavailable\n".to_string()
            }),
            (None, None) => "# script unavailable\n".to_string(),
        };
        fs::write(&paths.script, text).map_err(io_err(&paths.script))
    }

    fn append(&mut self, pick: impl FnOnce(&mut Streams) -> &mut Stream, record: serde_json::Value) -> Result<(), RecorderError> {
        match self.streams.as_mut() {
            Some(streams) => pick(streams).append(&record),
            None => Ok(()),
        }
    }

    /// Append a log record
    pub fn record_log(&mut self, level: &str, target: &str, msg: &str) -> Result<(), RecorderError> {
        let record = json!({ "ts": now(), "type": "log", "level": level, "target": target, "msg": msg });
        self.append(|s| &mut s.logs, record)
    }

    /// Append a state entry
    pub fn record_state(&mut self, name: &str) -> Result<(), RecorderError> {
        let record = json!({ "ts": now(), "type": "state", "name": name });
        self.append(|s| &mut s.states, record)
    }

    /// Append an event
    pub fn record_event(&mut self, name: &str, source: &str, payload: &Value) -> Result<(), RecorderError> {
        let record = json!({
            "ts": now(),
            "type": "event",
            "name": name,
            "source": source,
            "payload": payload.to_json(),
        });
        self.append(|s| &mut s.events, record)
    }

    /// Append an action attempt with its outcome
    pub fn record_action(&mut self, name: &str, args: &Args, outcome: ActionOutcome<'_>) -> Result<(), RecorderError> {
        let args = Value::Map(args.clone()).to_json();
        let record = match outcome {
            ActionOutcome::Ok(result) => json!({
                "ts": now(),
                "type": "action",
                "name": name,
                "args": args,
                "ok": true,
                "result": result.to_json(),
            }),
            ActionOutcome::Err { kind, message } => json!({
                "ts": now(),
                "type": "action",
                "name": name,
                "args": args,
                "ok": false,
                "error": { "type": kind, "msg": message },
            }),
        };
        self.append(|s| &mut s.actions, record)
    }

    /// Append a chart point
    pub fn record_chart(&mut self, payload: &Value) -> Result<(), RecorderError> {
        let record = json!({ "ts": now(), "type": "chart", "payload": payload.to_json() });
        self.append(|s| &mut s.charts, record)
    }

    /// Write the stop record and final variables, then flush and close every
    /// stream. Later calls do nothing.
    pub fn close(&mut self, final_vars: Option<&Variables>) -> Result<(), RecorderError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(mut streams) = self.streams.take() else {
            return Ok(());
        };

        let started = unix_seconds(self.started_at);
        let ended = now();
        let stop = json!({
            "ts": ended,
            "type": "recorder",
            "event": "stop",
            "started_at": started,
            "ended_at": ended,
            "duration_s": ended - started,
        });
        let mut result = streams.logs.append(&stop);

        if let (Some(vars), Some(paths)) = (final_vars, &self.paths) {
            let snapshot = Value::Map(vars.clone()).to_json();
            let written = serde_json::to_string_pretty(&snapshot)
                .map_err(RecorderError::from)
                .and_then(|text| fs::write(&paths.vars_snapshot, text).map_err(io_err(&paths.vars_snapshot)));
            result = result.and(written);
        }

        for stream in [
            &mut streams.logs,
            &mut streams.states,
            &mut streams.events,
            &mut streams.actions,
            &mut streams.charts,
        ] {
            let flushed = stream.writer.flush().map_err(io_err(&stream.path));
            result = result.and(flushed);
        }
        tracing::info!(run_id = %self.run_id, duration_s = ended - started, "recorder closed");
        result
    }
}

impl Drop for ExperimentRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close(None) {
            tracing::warn!(error = %e, "recorder close on drop failed");
        }
    }
}

fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn now() -> f64 {
    unix_seconds(Utc::now())
}

/// Keep alphanumerics and `-_.`, replace the rest with `_`, cap at 64 chars
pub fn sanitize_name(name: &str) -> String {
    let safe: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .take(64)
        .collect();
    if safe.is_empty() {
        "run".to_string()
    } else {
        safe
    }
}

fn unique_dir(base: &Path, stem: &str) -> PathBuf {
    let candidate = base.join(stem);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| base.join(format!("{stem}_{n}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &Path, name: &str) -> RecorderOptions {
        RecorderOptions {
            base_dir: dir.to_path_buf(),
            name: name.into(),
            script_text: Some("version: 1\n".into()),
            script_path: None,
        }
    }

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("pump test #1"), "pump_test__1");
        assert_eq!(sanitize_name("  "), "run");
        assert_eq!(sanitize_name(&"x".repeat(100)).len(), 64);
    }

    #[test]
    fn test_start_writes_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ExperimentRecorder::new(options(dir.path(), "demo"));
        let root = recorder.start().unwrap();
        assert!(root.file_name().unwrap().to_string_lossy().ends_with("_demo"));
        let paths = recorder.paths().unwrap().clone();
        assert_eq!(fs::read_to_string(&paths.script).unwrap(), "version: 1\n");
        let meta: serde_json::Value = serde_json::from_str(&fs::read_to_string(&paths.meta).unwrap()).unwrap();
        assert_eq!(meta["name"], "demo");
        assert_eq!(meta["environment"]["crate"], env!("CARGO_PKG_NAME"));
        for stream in [&paths.logs, &paths.states, &paths.events, &paths.actions, &paths.charts] {
            assert!(stream.exists());
        }
    }

    #[test]
    fn test_records_and_tagged_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ExperimentRecorder::new(options(dir.path(), "r"));
        recorder.start().unwrap();
        recorder.record_state("A").unwrap();
        let mut args = Args::new();
        args.insert("frame".into(), Value::bytes(vec![0x01, 0xFF]));
        recorder
            .record_action("send", &args, ActionOutcome::Ok(&Value::Float(f64::NAN)))
            .unwrap();
        recorder
            .record_action(
                "modbus_read",
                &Args::new(),
                ActionOutcome::Err {
                    kind: "ChannelTimeoutError",
                    message: "no reply".into(),
                },
            )
            .unwrap();
        let paths = recorder.paths().unwrap().clone();
        recorder.close(None).unwrap();

        let states = lines(&paths.states);
        assert_eq!(states[0]["name"], "A");
        assert!(states[0]["ts"].as_f64().unwrap() > 0.0);

        let actions = lines(&paths.actions);
        assert_eq!(actions[0]["args"]["frame"]["__type__"], "bytes");
        assert_eq!(actions[0]["args"]["frame"]["hex"], "01FF");
        assert_eq!(actions[0]["result"]["__type__"], "float");
        assert_eq!(actions[1]["ok"], false);
        assert_eq!(actions[1]["error"]["type"], "ChannelTimeoutError");
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ExperimentRecorder::new(options(dir.path(), "twice"));
        recorder.start().unwrap();
        let paths = recorder.paths().unwrap().clone();
        let mut vars = Variables::new();
        vars.insert("count".into(), Value::Int(3));
        recorder.close(Some(&vars)).unwrap();
        recorder.close(Some(&vars)).unwrap();
        recorder.record_state("late").unwrap();
        drop(recorder);

        let logs = lines(&paths.logs);
        assert_eq!(logs.iter().filter(|l| l["event"] == "stop").count(), 1);
        assert!(lines(&paths.states).is_empty());
        let snapshot: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.vars_snapshot).unwrap()).unwrap();
        assert_eq!(snapshot["count"], 3);
    }

    #[test]
    fn test_colliding_directory_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = ExperimentRecorder::new(options(dir.path(), "same"));
        let mut second = ExperimentRecorder::new(options(dir.path(), "same"));
        let a = first.start().unwrap();
        let b = second.start().unwrap();
        assert_ne!(a, b);
    }
}
