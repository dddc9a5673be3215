//! Script runner
//!
//! Parses a document, opens its channels, applies variable overrides,
//! optionally starts a recorder, executes, and always closes the context
//! before returning, whether the run succeeded or not.

use super::context::{ContextConfig, RuntimeContext};
use super::event::{CancelToken, EventSender};
use super::recorder::{ExperimentRecorder, RecorderOptions};
use crate::core::actions::ActionRegistry;
use crate::core::dsl::{parse, parse_task_list, Executor, RunSummary, ScriptAst};
use crate::core::error::EngineError;
use crate::core::protocol::ProtocolRegistry;
use crate::core::value::{Value, Variables};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::Level;

/// How to run a script
#[derive(Clone)]
pub struct RunOptions {
    /// Context tunables
    pub context: ContextConfig,
    /// Variables applied after the document's `vars`
    pub overrides: Variables,
    /// Start a recorder before the first state
    pub record: bool,
    /// Recorder run name (defaults to the script file stem, else `run`)
    pub record_name: Option<String>,
    /// Stop flag shared with the caller
    pub cancel: CancelToken,
    /// Actions available to the script
    pub actions: Arc<ActionRegistry>,
    /// Protocol drivers available to actions
    pub protocols: Arc<ProtocolRegistry>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            overrides: Variables::new(),
            record: false,
            record_name: None,
            cancel: CancelToken::new(),
            actions: Arc::new(ActionRegistry::with_builtins()),
            protocols: Arc::new(ProtocolRegistry::with_builtins()),
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// States visited
    pub summary: RunSummary,
    /// Variables at the end of the run
    pub vars: Variables,
    /// Recorder directory, when the run was recorded
    pub record_dir: Option<PathBuf>,
}

/// Result of one task in a task list
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    /// Action name
    pub action: String,
    /// Action result
    pub result: Value,
}

/// Parse and run a script held in memory
pub fn run_script(source: &str, options: RunOptions) -> Result<RunOutcome, EngineError> {
    let script = parse(source)?;
    let ctx = prepare(&script.vars, Some(source.to_string()), None, &options);
    drive(ctx, &script, &options)
}

/// Read, parse and run a script file
pub fn run_file(path: &Path, mut options: RunOptions) -> Result<RunOutcome, EngineError> {
    let source = std::fs::read_to_string(path)?;
    let script = parse(&source)?;
    if options.record_name.is_none() {
        options.record_name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
    }
    let ctx = prepare(&script.vars, Some(source), Some(path.to_path_buf()), &options);
    drive(ctx, &script, &options)
}

/// Handle to a script running on a worker thread
pub struct RunHandle {
    cancel: CancelToken,
    events: EventSender,
    thread: JoinHandle<Result<RunOutcome, EngineError>>,
}

impl RunHandle {
    /// Request a stop; waits and blocking reads observe it within one poll interval
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Queue for events delivered to the script
    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Whether the run has ended
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run to end
    pub fn join(self) -> Result<RunOutcome, EngineError> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(EngineError::Io(std::io::Error::other("script thread panicked"))))
    }
}

/// Parse `source` on the calling thread and run it on a named worker thread
pub fn spawn_script(source: String, options: RunOptions) -> Result<RunHandle, EngineError> {
    let script = parse(&source)?;
    let ctx = prepare(&script.vars, Some(source), None, &options);
    let events = ctx.event_sender();
    let cancel = options.cancel.clone();
    let thread = std::thread::Builder::new()
        .name("protoflow-run".into())
        .spawn(move || drive(ctx, &script, &options))?;
    Ok(RunHandle { cancel, events, thread })
}

/// Run a task-list document: every task once, in order, stopping at the
/// first failure. Channels are closed in every case.
pub fn run_tasks(source: &str, options: RunOptions) -> Result<Vec<TaskOutcome>, EngineError> {
    let tasks = parse_task_list(source)?;
    let mut ctx = prepare(&tasks.vars, Some(source.to_string()), None, &options);

    let result = (|| {
        ctx.open_channels(&tasks.channels)?;
        let mut outcomes = Vec::with_capacity(tasks.tasks.len());
        for (idx, task) in tasks.tasks.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            tracing::info!(task = idx + 1, of = tasks.tasks.len(), action = %task.name, "running task");
            let result = ctx.run_action(&task.name, &task.args)?;
            outcomes.push(TaskOutcome {
                action: task.name.clone(),
                result,
            });
        }
        Ok(outcomes)
    })();

    if let Err(e) = &result {
        tracing::error!(error = %e, "task list failed");
    }
    let closed = ctx.close();
    let outcomes = result?;
    closed?;
    Ok(outcomes)
}

/// Read and run a task-list file
pub fn run_tasks_file(path: &Path, options: RunOptions) -> Result<Vec<TaskOutcome>, EngineError> {
    let source = std::fs::read_to_string(path)?;
    run_tasks(&source, options)
}

fn prepare(vars: &Variables, text: Option<String>, path: Option<PathBuf>, options: &RunOptions) -> RuntimeContext {
    let mut ctx = RuntimeContext::new(options.actions.clone(), options.protocols.clone(), options.context.clone());
    ctx.set_cancel_token(options.cancel.clone());
    ctx.set_script(text, path);
    for (name, value) in vars.iter().chain(options.overrides.iter()) {
        ctx.set_var(name.clone(), value.clone());
    }
    ctx
}

fn start_recording(ctx: &mut RuntimeContext, options: &RunOptions) -> Result<(), EngineError> {
    let mut recorder = ExperimentRecorder::new(RecorderOptions {
        base_dir: options.context.record_dir.clone(),
        name: options.record_name.clone().unwrap_or_else(|| "run".into()),
        script_text: ctx.script_text().map(str::to_string),
        script_path: ctx.script_path().cloned(),
    });
    let root = recorder.start()?;
    ctx.set_var("record_dir", Value::from(root.to_string_lossy().into_owned()));
    ctx.attach_recorder(recorder)?;
    tracing::info!(dir = %root.display(), "recording run");
    Ok(())
}

fn drive(mut ctx: RuntimeContext, script: &ScriptAst, options: &RunOptions) -> Result<RunOutcome, EngineError> {
    let result = (|| {
        ctx.open_channels(&script.channels)?;
        if options.record {
            start_recording(&mut ctx, options)?;
        }
        Executor::new(script).run(&mut ctx)
    })();

    if let Err(e) = &result {
        if let Err(log_err) = ctx.log(Level::ERROR, &format!("run failed: {e}")) {
            tracing::warn!(error = %log_err, "failed to record run error");
        }
    }
    let record_dir = ctx
        .recorder()
        .and_then(ExperimentRecorder::root)
        .map(Path::to_path_buf)
        .or_else(|| ctx.get_var("record_dir").and_then(Value::as_str).map(PathBuf::from));
    let vars = ctx.vars().clone();
    let closed = ctx.close();
    let summary = result?;
    closed?;
    Ok(RunOutcome {
        summary,
        vars,
        record_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> RunOptions {
        RunOptions {
            context: ContextConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_overrides_win_over_document_vars() {
        let mut opts = options();
        opts.overrides.insert("limit".into(), Value::Int(9));
        let outcome = run_script(
            r#"
vars: { limit: 1, hits: 0 }
state_machine:
  initial: start
  states:
    start:
      actions:
        - set: { hits: "$limit * 2" }
"#,
            opts,
        )
        .unwrap();
        assert_eq!(outcome.vars.get("hits"), Some(&Value::Int(18)));
        assert_eq!(outcome.summary.visited, ["start"]);
        assert!(outcome.record_dir.is_none());
    }

    #[test]
    fn test_parse_error_before_io() {
        let err = run_script("state_machine: { states: {} }", options()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_spawned_run_receives_events() {
        let handle = spawn_script(
            r#"
state_machine:
  initial: idle
  states:
    idle:
      timeout: 5000
      on_event: { start: done }
      on_timeout: done
    done:
      actions:
        - set: { started: "$event_name == 'start'" }
"#
            .to_string(),
            options(),
        )
        .unwrap();
        assert!(handle.events().send("start", Value::Null));
        let outcome = handle.join().unwrap();
        assert_eq!(outcome.vars.get("started"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_spawned_run_can_be_cancelled() {
        let handle = spawn_script(
            "state_machine: { initial: idle, states: { idle: { on_event: { x: idle } } } }".to_string(),
            options(),
        )
        .unwrap();
        handle.cancel();
        assert!(matches!(handle.join(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_task_list_stops_at_first_failure() {
        let outcomes = run_tasks(
            "tasks:\n  - set: { a: 1 }\n  - action: set\n    b: \"$a + 1\"\n",
            options(),
        )
        .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].result.get("b"), Some(&Value::Int(2)));

        let err = run_tasks("tasks:\n  - action: missing\n  - set: { a: 1 }\n", options()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownAction(_)));
        assert!(run_tasks("tasks: []", options()).unwrap().is_empty());
    }
}
