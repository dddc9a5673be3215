//! Recorder control from scripts

use super::{eval_arg, ActionRegistry};
use crate::core::error::EngineError;
use crate::core::runtime::recorder::{ExperimentRecorder, RecorderOptions};
use crate::core::runtime::RuntimeContext;
use crate::core::value::{Args, Value};
use std::path::PathBuf;
use tracing::Level;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("record_start", record_start);
    registry.register("record_stop", record_stop);
}

fn text_arg(ctx: &RuntimeContext, args: &Args, key: &str) -> Result<Option<String>, EngineError> {
    Ok(eval_arg(ctx, args, &[key])?
        .map(|v| v.to_string())
        .filter(|s| !s.is_empty()))
}

/// Start and attach a recorder; returns the run directory. A running
/// recorder is kept.
fn record_start(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    if let Some(root) = ctx.recorder().and_then(ExperimentRecorder::root) {
        return Ok(Value::from(root.to_string_lossy().into_owned()));
    }
    let options = RecorderOptions {
        base_dir: text_arg(ctx, args, "dir")?.map_or_else(|| ctx.config().record_dir.clone(), PathBuf::from),
        name: text_arg(ctx, args, "name")?.unwrap_or_else(|| "run".into()),
        script_text: text_arg(ctx, args, "script_text")?.or_else(|| ctx.script_text().map(str::to_string)),
        script_path: text_arg(ctx, args, "script_path")?
            .map(PathBuf::from)
            .or_else(|| ctx.script_path().cloned()),
    };
    let mut recorder = ExperimentRecorder::new(options);
    let root = recorder.start()?;
    let root = root.to_string_lossy().into_owned();
    ctx.attach_recorder(recorder)?;
    ctx.set_var("record_dir", Value::from(root.as_str()));
    ctx.log(Level::INFO, &format!("recording to {root}"))?;
    Ok(Value::from(root))
}

/// Close and detach the recorder; returns its directory or null
fn record_stop(ctx: &mut RuntimeContext, _args: &Args) -> Result<Value, EngineError> {
    let Some(root) = ctx.recorder().and_then(ExperimentRecorder::root).map(|r| r.to_path_buf()) else {
        return Ok(Value::Null);
    };
    ctx.close_recorder()?;
    tracing::info!(dir = %root.display(), "recording stopped");
    Ok(Value::from(root.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{args, context};
    use super::*;

    fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_start_and_stop_record_themselves_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context();
        let root = ctx
            .run_action(
                "record_start",
                &args([("dir", Value::from(dir.path().to_string_lossy().into_owned())), ("name", Value::from("bench a"))]),
            )
            .unwrap();
        let root = PathBuf::from(root.as_str().unwrap());
        assert!(root.file_name().unwrap().to_string_lossy().ends_with("_bench_a"));
        assert_eq!(ctx.get_var("record_dir").and_then(Value::as_str), root.to_str());

        ctx.run_action("set", &args([("x", Value::Int(1))])).unwrap();
        ctx.run_action("record_stop", &Args::new()).unwrap();
        ctx.run_action("set", &args([("y", Value::Int(2))])).unwrap();
        assert_eq!(ctx.run_action("record_stop", &Args::new()).unwrap(), Value::Null);

        let names: Vec<String> = lines(&root.join("actions.jsonl"))
            .iter()
            .map(|r| r["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["record_start", "set", "record_stop"]);
        assert!(root.join("vars_snapshot.json").exists());
    }
}
