//! Protocol actions: Modbus, XMODEM/YMODEM, SCPI and AT

use super::{eval_arg, eval_args, int_arg, save_as, ActionRegistry};
use crate::core::error::EngineError;
use crate::core::protocol::xmodem::{self, CheckMode, BLOCK_SIZE, EOT, SOH, SUB};
use crate::core::protocol::{param_str, ProtocolKind};
use crate::core::runtime::RuntimeContext;
use crate::core::value::{Args, Value};
use std::path::Path;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register("modbus_read", |ctx, args| modbus(ctx, args, "modbus_read"));
    registry.register("modbus_write", |ctx, args| modbus(ctx, args, "modbus_write"));
    registry.register("modbus_request", |ctx, args| modbus(ctx, args, "modbus_request"));
    registry.register("xmodem_send", |ctx, args| transfer(ctx, args, ProtocolKind::Xmodem));
    registry.register("ymodem_send", |ctx, args| transfer(ctx, args, ProtocolKind::Ymodem));
    registry.register("send_xmodem_block", send_xmodem_block);
    registry.register("send_eot", send_eot);
    registry.register("scpi_command", |ctx, args| exchange(ctx, args, ProtocolKind::Scpi));
    registry.register("at_command", |ctx, args| exchange(ctx, args, ProtocolKind::At));
}

fn modbus_kind(action: &str, name: &str) -> Result<ProtocolKind, EngineError> {
    match name.to_ascii_lowercase().as_str() {
        "rtu" | "modbus_rtu" => Ok(ProtocolKind::ModbusRtu),
        "ascii" | "modbus_ascii" => Ok(ProtocolKind::ModbusAscii),
        "tcp" | "modbus_tcp" => Ok(ProtocolKind::ModbusTcp),
        other => Err(EngineError::invalid_argument(
            action,
            format!("protocol must be rtu, ascii or tcp, got {other}"),
        )),
    }
}

/// Channel named by the `channel` argument, if any
fn channel_arg(ctx: &RuntimeContext, args: &Args) -> Result<Option<String>, EngineError> {
    Ok(eval_arg(ctx, args, &["channel"])?.map(|v| v.to_string()))
}

fn modbus(ctx: &mut RuntimeContext, args: &Args, action: &str) -> Result<Value, EngineError> {
    let mut params = eval_args(ctx, args)?;
    let kind = modbus_kind(action, &param_str(&params, &["protocol"]).unwrap_or_else(|| "rtu".into()))?;
    // RTU/ASCII fall back to the configured defaults; TCP keeps its own
    if kind != ProtocolKind::ModbusTcp {
        let defaults = ctx.config().modbus;
        params
            .entry("retries".into())
            .or_insert_with(|| Value::from(defaults.retries));
        params.entry("timeout".into()).or_insert_with(|| {
            Value::from(u64::try_from(defaults.timeout.as_millis()).unwrap_or(u64::MAX))
        });
    }
    let channel = channel_arg(ctx, args)?;
    let result = ctx.execute_protocol(channel.as_deref(), kind.as_str(), &params)?;
    ctx.set_var("last_modbus", result.clone());
    save_as(ctx, args, &result);
    Ok(result)
}

fn transfer(ctx: &mut RuntimeContext, args: &Args, kind: ProtocolKind) -> Result<Value, EngineError> {
    let mut params = eval_args(ctx, args)?;
    if !params.contains_key("file") && !params.contains_key("path") && !params.contains_key("data") {
        if let Some(path) = ctx.get_var("file_path").cloned() {
            params.insert("file".into(), path);
        }
    }
    let channel = channel_arg(ctx, args)?;
    let result = ctx.execute_protocol(channel.as_deref(), kind.as_str(), &params)?;
    save_as(ctx, args, &result);
    Ok(result)
}

fn exchange(ctx: &mut RuntimeContext, args: &Args, kind: ProtocolKind) -> Result<Value, EngineError> {
    let params = eval_args(ctx, args)?;
    let channel = channel_arg(ctx, args)?;
    let result = ctx.execute_protocol(channel.as_deref(), kind.as_str(), &params)?;
    save_as(ctx, args, &result);
    Ok(result)
}

/// Publish `file`, `file_size` and `file_block_count` for the file in `file_path`
fn file_meta(ctx: &mut RuntimeContext, action: &str) -> Result<String, EngineError> {
    let path = ctx
        .get_var("file_path")
        .map(Value::to_string)
        .ok_or_else(|| EngineError::invalid_argument(action, "variable file_path is not set"))?;
    let size = std::fs::metadata(&path)?.len();
    let blocks = xmodem::block_count(size, BLOCK_SIZE);
    let name = Path::new(&path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    ctx.set_var(
        "file",
        Value::map([
            ("path", Value::from(path.as_str())),
            ("name", Value::from(name)),
            ("size", Value::from(size)),
            ("block_count", Value::from(blocks)),
        ]),
    );
    ctx.set_var("file_size", Value::from(size));
    ctx.set_var("file_block_count", Value::from(blocks));
    Ok(path)
}

/// Send one CRC-mode XMODEM block of the file in `file_path`; ACK handling is
/// left to the script's states
fn send_xmodem_block(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let path = file_meta(ctx, "send_xmodem_block")?;
    let block = int_arg(ctx, "send_xmodem_block", args, &["block"])?.unwrap_or(1);
    let block_no = u64::try_from(block)
        .ok()
        .filter(|b| *b >= 1)
        .ok_or_else(|| EngineError::invalid_argument("send_xmodem_block", "block must be >= 1"))?;
    let data = xmodem::read_block(Path::new(&path), block_no, BLOCK_SIZE)?;
    let packet = xmodem::build_block(SOH, (block_no & 0xFF) as u8, &data, BLOCK_SIZE, SUB, CheckMode::Crc16);
    let channel = channel_arg(ctx, args)?;
    ctx.write_to_channel(channel.as_deref(), &packet)?;
    ctx.set_var("last_sent_block", Value::from(block_no));
    Ok(Value::from(block_no))
}

fn send_eot(ctx: &mut RuntimeContext, args: &Args) -> Result<Value, EngineError> {
    let channel = channel_arg(ctx, args)?;
    ctx.write_to_channel(channel.as_deref(), &[EOT])?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::super::testing::{args, context};
    use super::*;
    use crate::core::channel::{
        MatchCondition, ModbusFraming, ResponseAction, SimulatedChannel, SimulatorConfig, SimulatorHandle,
    };
    use crate::core::protocol::checksum::crc16_xmodem;
    use crate::core::protocol::ProtocolError;

    fn modbus_context(framing: ModbusFraming) -> (RuntimeContext, SimulatorHandle) {
        let config = SimulatorConfig {
            registers: vec![10, 20, 30, 40],
            coils: vec![false; 8],
            ..Default::default()
        }
        .with_rule(
            MatchCondition::Any,
            ResponseAction::Modbus {
                framing,
                unit_id: None,
            },
        );
        let sim = SimulatedChannel::new(config).unwrap();
        let handle = sim.handle();
        let mut ctx = context();
        ctx.add_channel("plc", Box::new(sim));
        (ctx, handle)
    }

    #[test]
    fn test_modbus_read_and_write_rtu() {
        let (mut ctx, handle) = modbus_context(ModbusFraming::Rtu);
        let read = ctx
            .run_action(
                "modbus_read",
                &args([
                    ("function", Value::Int(3)),
                    ("address", Value::Int(1)),
                    ("quantity", Value::Int(2)),
                    ("save_as", Value::from("regs")),
                ]),
            )
            .unwrap();
        assert_eq!(read.get("registers"), Some(&Value::List(vec![Value::Int(20), Value::Int(30)])));
        assert_eq!(ctx.get_var("regs"), Some(&read));
        assert_eq!(ctx.get_var("last_modbus"), Some(&read));

        ctx.set_var("target", Value::Int(777));
        ctx.run_action(
            "modbus_write",
            &args([("function", Value::Int(6)), ("address", Value::Int(3)), ("value", Value::from("$target"))]),
        )
        .unwrap();
        assert_eq!(handle.registers()[3], 777);
    }

    #[test]
    fn test_modbus_tcp_transaction_ids_increase() {
        let (mut ctx, _) = modbus_context(ModbusFraming::Tcp);
        let read = args([("protocol", Value::from("tcp")), ("address", Value::Int(0)), ("quantity", Value::Int(1))]);
        let first = ctx.run_action("modbus_read", &read).unwrap();
        let second = ctx.run_action("modbus_read", &read).unwrap();
        assert_eq!(first.get("transaction_id"), Some(&Value::Int(1)));
        assert_eq!(second.get("transaction_id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_modbus_rejects_unknown_protocol() {
        let (mut ctx, _) = modbus_context(ModbusFraming::Rtu);
        let err = ctx
            .run_action("modbus_read", &args([("protocol", Value::from("udp"))]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[test]
    fn test_modbus_timeout_surfaces_after_retries() {
        let mut ctx = context();
        ctx.add_channel("silent", Box::new(SimulatedChannel::new(SimulatorConfig::default()).unwrap()));
        let err = ctx
            .run_action(
                "modbus_read",
                &args([("retries", Value::Int(2)), ("timeout", Value::Int(20))]),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ProtocolError::Timeout(_))));
    }

    #[test]
    fn test_send_xmodem_block_sets_file_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![0x55; 200]).unwrap();

        let sim = SimulatedChannel::new(SimulatorConfig::default()).unwrap();
        let handle = sim.handle();
        let mut ctx = context();
        ctx.add_channel("dev", Box::new(sim));
        ctx.set_var("file_path", Value::from(path.to_string_lossy().into_owned()));

        ctx.run_action("send_xmodem_block", &args([("block", Value::Int(2))])).unwrap();
        ctx.run_action("send_eot", &Args::new()).unwrap();

        assert_eq!(ctx.get_var("file_size"), Some(&Value::Int(200)));
        assert_eq!(ctx.get_var("file_block_count"), Some(&Value::Int(2)));
        assert_eq!(ctx.get_var("last_sent_block"), Some(&Value::Int(2)));

        let written = handle.written();
        let packet = &written[0];
        assert_eq!(&packet[..3], &[SOH, 2, 0xFD]);
        assert_eq!(&packet[3..75], &[0x55; 72][..]);
        assert!(packet[75..131].iter().all(|b| *b == SUB));
        assert_eq!(&packet[131..], &crc16_xmodem(&packet[3..131]).to_be_bytes());
        assert_eq!(written[1], vec![EOT]);
    }

    #[test]
    fn test_at_command_through_simulator() {
        let config = SimulatorConfig::default().with_rule(
            MatchCondition::Text {
                text: "AT+GMR".into(),
                case_sensitive: true,
            },
            ResponseAction::SendText {
                text: "AT+GMR\r\nV1.2\r\nOK\r\n".into(),
            },
        );
        let mut ctx = context();
        ctx.add_channel("modem", Box::new(SimulatedChannel::new(config).unwrap()));
        let result = ctx
            .run_action("at_command", &args([("cmd", Value::from("+GMR")), ("save_as", Value::from("ver"))]))
            .unwrap();
        assert_eq!(result.get("ok"), Some(&Value::Bool(true)));
        assert_eq!(result.get("lines"), Some(&Value::List(vec![Value::from("V1.2")])));
        assert!(ctx.get_var("ver").is_some());
    }
}
