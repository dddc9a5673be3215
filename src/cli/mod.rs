//! CLI Module
//!
//! Provides command-line support shared by the `protoflow` binary:
//! - Exit codes for automation
//! - Tracing subscriber setup
//! - `--set name=value` parsing

pub mod exit_codes;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};

use crate::config::LoggingConfig;
use crate::core::value::Value;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Filter directive for `-v`/`-q` counts, falling back to the configured level
pub fn filter_directive(config: &LoggingConfig, verbose: u8, quiet: bool) -> String {
    if quiet {
        return "error".into();
    }
    match verbose {
        0 => config.level.clone(),
        1 => "debug".into(),
        _ => "trace".into(),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `directive`.
/// Keep the returned guard alive until exit so the file writer flushes.
pub fn init_logging(config: &LoggingConfig, directive: &str, json: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let (file_writer, guard) = match &config.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let prefix = path.file_name().map_or_else(|| "protoflow.log".into(), |n| n.to_string_lossy().into_owned());
            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = match (json || config.json, file_writer) {
        (true, Some(file)) => builder.json().with_writer(std::io::stderr.and(file)).try_init(),
        (true, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, Some(file)) => builder.with_writer(std::io::stderr.and(file)).try_init(),
        (false, None) => builder.with_writer(std::io::stderr).try_init(),
    };
    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
    guard
}

/// Parse `name=value`; the value is read as YAML so numbers, booleans and
/// lists keep their type
pub fn parse_assignment(text: &str) -> Result<(String, Value), String> {
    let (name, raw) = text
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{text}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty variable name in `{text}`"));
    }
    let value = match serde_yaml::from_str::<serde_yaml::Value>(raw) {
        Ok(serde_yaml::Value::Null) if !raw.trim().is_empty() && raw.trim() != "null" => Value::from(raw),
        Ok(parsed) => Value::from(parsed),
        Err(_) => Value::from(raw),
    };
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_types() {
        assert_eq!(parse_assignment("n=3").unwrap(), ("n".into(), Value::Int(3)));
        assert_eq!(parse_assignment("flag=true").unwrap().1, Value::Bool(true));
        assert_eq!(parse_assignment("port=/dev/ttyUSB0").unwrap().1, Value::from("/dev/ttyUSB0"));
        assert_eq!(
            parse_assignment("ids=[1, 2]").unwrap().1,
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(parse_assignment("empty=").unwrap().1, Value::Null);
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn test_filter_directive() {
        let config = LoggingConfig::default();
        assert_eq!(filter_directive(&config, 0, false), "info");
        assert_eq!(filter_directive(&config, 2, false), "trace");
        assert_eq!(filter_directive(&config, 2, true), "error");
    }
}
