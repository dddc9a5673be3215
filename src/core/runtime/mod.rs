//! Run-time machinery: context, events, recorder and the script runner

pub mod context;
pub mod event;
pub mod recorder;
pub mod runner;

pub use context::{evaluate_in, item_scope, ContextConfig, RuntimeContext};
pub use event::{event_queue, CancelToken, Event, EventSender, EventSource};
pub use recorder::{ExperimentRecorder, RecorderError, RecorderOptions, RecorderPaths};
pub use runner::{run_file, run_script, run_tasks, run_tasks_file, spawn_script, RunHandle, RunOptions, RunOutcome, TaskOutcome};
