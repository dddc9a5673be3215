//! YAML script parser
//!
//! Single pass from the document tree to [`ScriptAst`]. Action shorthands are
//! normalized here so the executor only ever sees [`ActionCall`]s.

use super::ast::{
    ActionCall, ChannelDecl, ChartSpec, ControlAction, ControlInput, ControlSpec, LayoutNode,
    Orientation, ScriptAst, State, StateMachine, TaskList, UiConfig,
};
use crate::core::channel::ChannelConfig;
use crate::core::error::ScriptError;
use crate::core::value::{Args, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

type Mapping = Map;

/// Parse a script document
pub fn parse(source: &str) -> Result<ScriptAst, ScriptError> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(source).map_err(|e| ScriptError::Yaml(e.to_string()))?;
    let channels = parse_channels(&yaml)?;
    let root = Value::from(yaml);
    let empty = Mapping::new();
    let doc = match &root {
        Value::Map(m) => m,
        Value::Null => &empty,
        _ => return Err(ScriptError::invalid("<root>", "document must be a mapping")),
    };

    let version = match doc.get("version") {
        None | Some(Value::Null) => 1,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| ScriptError::invalid("version", "must be an integer"))?,
    };

    let vars = match doc.get("vars") {
        None | Some(Value::Null) => Mapping::new(),
        Some(Value::Map(m)) => m.clone(),
        Some(_) => return Err(ScriptError::invalid("vars", "must be a mapping")),
    };

    let ui = match doc.get("ui") {
        None | Some(Value::Null) => UiConfig::default(),
        Some(Value::Map(m)) => parse_ui(m)?,
        Some(_) => return Err(ScriptError::invalid("ui", "must be a mapping")),
    };

    let state_machine = parse_state_machine(doc.get("state_machine"))?;

    Ok(ScriptAst {
        version,
        vars,
        channels,
        state_machine,
        ui,
    })
}

/// Parse a task-list document: `vars`, `channels` and a flat `tasks` list.
/// A task is `{action: name, ...args}`, `{action: name, args: {...}}` or
/// any action shorthand.
pub fn parse_task_list(source: &str) -> Result<TaskList, ScriptError> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(source).map_err(|e| ScriptError::Yaml(e.to_string()))?;
    let channels = parse_channels(&yaml)?;
    let root = Value::from(yaml);
    let Value::Map(doc) = root else {
        return Err(ScriptError::invalid("<root>", "document must be a mapping"));
    };
    let vars = match doc.get("vars") {
        None | Some(Value::Null) => Mapping::new(),
        Some(Value::Map(m)) => m.clone(),
        Some(_) => return Err(ScriptError::invalid("vars", "must be a mapping")),
    };
    let items = match doc.get("tasks") {
        None | Some(Value::Null) => &[][..],
        Some(Value::List(items)) => items.as_slice(),
        Some(_) => return Err(ScriptError::invalid("tasks", "must be a list")),
    };
    let tasks = items
        .iter()
        .enumerate()
        .map(|(idx, item)| parse_task(item, &format!("tasks[{idx}]")))
        .collect::<Result<_, _>>()?;
    Ok(TaskList { vars, channels, tasks })
}

fn parse_task(item: &Value, path: &str) -> Result<ActionCall, ScriptError> {
    if let Value::Map(entry) = item {
        if let (Some(name), None) = (entry.get("action"), entry.get("args")) {
            let name = name
                .as_str()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ScriptError::invalid(path, "action name must be a string"))?;
            let args = entry
                .iter()
                .filter(|(k, _)| k.as_str() != "action")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return Ok(ActionCall::new(name, args));
        }
    }
    parse_action(item, path)
}

/// Parse a list of action entries (a state's `do` block or an inline branch)
pub fn parse_actions(items: &Value, path: &str) -> Result<Vec<ActionCall>, ScriptError> {
    match items {
        Value::Null => Ok(Vec::new()),
        Value::List(list) => list
            .iter()
            .enumerate()
            .map(|(idx, item)| parse_action(item, &format!("{path}[{idx}]")))
            .collect(),
        _ => Err(ScriptError::invalid(path, "actions must be a list")),
    }
}

/// Normalize one action entry
pub fn parse_action(item: &Value, path: &str) -> Result<ActionCall, ScriptError> {
    let Value::Map(entry) = item else {
        return Err(ScriptError::invalid(path, format!("invalid action entry: {item}")));
    };

    if let Some(name) = entry.get("action") {
        let name = name
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScriptError::invalid(path, "action name must be a string"))?;
        let args = mapping_or_empty(entry.get("args"), &format!("{path}.args"))?;
        return Ok(ActionCall::new(name, args));
    }
    if let Some(body) = entry.get("if") {
        return Ok(ActionCall::new("if", mapping_or_empty(Some(body), &format!("{path}.if"))?));
    }
    if let Some(body) = entry.get("set") {
        let Value::Map(assignments) = body else {
            return Err(ScriptError::invalid(format!("{path}.set"), "must be a mapping"));
        };
        return Ok(ActionCall::new("set", assignments.clone()));
    }
    if let Some(message) = entry.get("log") {
        return Ok(ActionCall::new("log", single("message", message.clone())));
    }
    if let Some(body) = entry.get("wait") {
        let args = match body {
            Value::Map(m) => m.clone(),
            other => single("ms", other.clone()),
        };
        return Ok(ActionCall::new("wait", args));
    }
    if let Some(body) = entry.get("wait_for_event") {
        let args = match body {
            Value::Map(m) => m.clone(),
            other => single("event", other.clone()),
        };
        return Ok(ActionCall::new("wait_for_event", args));
    }

    let keys: Vec<&str> = entry.keys().map(String::as_str).collect();
    Err(ScriptError::invalid(
        path,
        format!("unknown action type (keys: {})", keys.join(", ")),
    ))
}

fn single(key: &str, value: Value) -> Args {
    let mut args = Args::new();
    args.insert(key.to_string(), value);
    args
}

fn mapping_or_empty(value: Option<&Value>, path: &str) -> Result<Args, ScriptError> {
    match value {
        None | Some(Value::Null) => Ok(Args::new()),
        Some(Value::Map(m)) => Ok(m.clone()),
        Some(_) => Err(ScriptError::invalid(path, "must be a mapping")),
    }
}

fn parse_channels(yaml: &serde_yaml::Value) -> Result<Vec<ChannelDecl>, ScriptError> {
    let Some(section) = yaml.get("channels") else {
        return Ok(Vec::new());
    };
    let Some(mapping) = section.as_mapping() else {
        if section.is_null() {
            return Ok(Vec::new());
        }
        return Err(ScriptError::invalid("channels", "must be a mapping"));
    };

    // serde_yaml mappings keep declaration order, which decides the default channel
    let mut channels = Vec::with_capacity(mapping.len());
    for (key, cfg) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| ScriptError::invalid("channels", "channel names must be strings"))?
            .to_string();
        let path = format!("channels.{name}");
        let mut json = Value::from(cfg.clone()).to_json();
        let obj = json
            .as_object_mut()
            .ok_or_else(|| ScriptError::invalid(&path, "must be a mapping"))?;
        let kind = obj
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("serial")
            .to_ascii_lowercase();
        obj.insert("type".to_string(), serde_json::Value::String(kind));
        let config: ChannelConfig =
            serde_json::from_value(json).map_err(|e| ScriptError::invalid(&path, e.to_string()))?;
        channels.push(ChannelDecl { name, config });
    }
    Ok(channels)
}

fn parse_state_machine(section: Option<&Value>) -> Result<StateMachine, ScriptError> {
    let empty = Mapping::new();
    let sm = match section {
        None | Some(Value::Null) => &empty,
        Some(Value::Map(m)) => m,
        Some(_) => return Err(ScriptError::invalid("state_machine", "must be a mapping")),
    };

    let mut states = BTreeMap::new();
    match sm.get("states") {
        None | Some(Value::Null) => {}
        Some(Value::Map(nodes)) => {
            for (name, node) in nodes {
                states.insert(name.clone(), parse_state(name, node)?);
            }
        }
        Some(_) => return Err(ScriptError::invalid("state_machine.states", "must be a mapping")),
    }

    let initial = sm
        .get("initial")
        .and_then(Value::as_str)
        .filter(|name| states.contains_key(*name))
        .ok_or(ScriptError::InvalidInitial)?
        .to_string();

    Ok(StateMachine { initial, states })
}

fn parse_state(name: &str, node: &Value) -> Result<State, ScriptError> {
    let path = format!("state_machine.states.{name}");
    let empty = Mapping::new();
    let node = match node {
        Value::Null => &empty,
        Value::Map(m) => m,
        _ => return Err(ScriptError::invalid(&path, "state must be a mapping")),
    };

    // `actions` is accepted as an alias of `do`
    let (key, body) = match (node.get("do"), node.get("actions")) {
        (Some(body), _) => ("do", body),
        (None, Some(body)) => ("actions", body),
        (None, None) => ("do", &Value::Null),
    };
    let actions = parse_actions(body, &format!("{path}.{key}"))?;

    let mut on_event = BTreeMap::new();
    match node.get("on_event") {
        None | Some(Value::Null) => {}
        Some(Value::Map(m)) => {
            for (event, target) in m {
                on_event.insert(event.clone(), target.to_string());
            }
        }
        Some(_) => return Err(ScriptError::invalid(format!("{path}.on_event"), "must be a mapping")),
    }

    let timeout = match node.get("timeout") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let ms = v
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .ok_or_else(|| ScriptError::invalid(format!("{path}.timeout"), "must be a non-negative number of ms"))?;
            Some(Duration::from_secs_f64(ms / 1000.0))
        }
    };

    Ok(State {
        name: name.to_string(),
        actions,
        on_event,
        timeout,
        on_timeout: opt_string(node.get("on_timeout")),
        when: node.get("when").filter(|v| !v.is_null()).cloned(),
        goto: opt_string(node.get("goto")),
        else_goto: opt_string(node.get("else_goto")),
    })
}

fn opt_string(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.to_string()),
    }
}

/// Non-empty string view of a scalar, matching how YAML authors write ids
fn text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) if !v.is_truthy() => None,
        Some(v) => Some(v.to_string()),
    }
}

fn flag(value: Option<&Value>, default: bool) -> bool {
    value.map_or(default, Value::is_truthy)
}

fn parse_ui(ui: &Mapping) -> Result<UiConfig, ScriptError> {
    Ok(UiConfig {
        charts: parse_charts(ui.get("charts"))?,
        controls: parse_controls(ui.get("controls"))?,
        layout: match ui.get("layout") {
            None | Some(Value::Null) => None,
            Some(Value::Map(m)) if m.is_empty() => None,
            Some(Value::Map(m)) => Some(parse_layout_node(m, "ui.layout")?),
            Some(_) => return Err(ScriptError::invalid("ui.layout", "must be a mapping")),
        },
    })
}

fn list_items<'a>(value: Option<&'a Value>, path: &str) -> Result<&'a [Value], ScriptError> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::List(items)) => Ok(items),
        Some(_) => Err(ScriptError::invalid(path, "must be a list")),
    }
}

fn parse_charts(section: Option<&Value>) -> Result<Vec<ChartSpec>, ScriptError> {
    let mut charts = Vec::new();
    for (idx, item) in list_items(section, "ui.charts")?.iter().enumerate() {
        let path = format!("ui.charts[{idx}]");
        let Value::Map(chart) = item else {
            return Err(ScriptError::invalid(path, "must be a mapping"));
        };
        let id = text(chart.get("id")).unwrap_or_else(|| format!("chart_{idx}"));
        let chart_type = text(chart.get("type"))
            .unwrap_or_else(|| "line".to_string())
            .to_lowercase();
        let bind_x = text(chart.get("bind_x"));
        let bind_y = text(chart.get("bind_y"));
        let bind_z = text(chart.get("bind_z"));

        let mut bind = text(chart.get("bind"));
        if chart_type == "scatter3d" && bind.is_none() {
            bind = Some(
                bind_z
                    .clone()
                    .or_else(|| bind_y.clone())
                    .or_else(|| bind_x.clone())
                    .unwrap_or_else(|| id.clone()),
            );
        }
        let bind = bind.ok_or_else(|| ScriptError::invalid(&path, "missing bind"))?;

        let group = text(chart.get("group"));
        let separate = flag(chart.get("separate"), false);
        if group.is_some() && separate {
            return Err(ScriptError::invalid(&path, "cannot have both group and separate"));
        }
        if chart_type == "scatter3d" && (bind_x.is_none() || bind_y.is_none() || bind_z.is_none()) {
            return Err(ScriptError::invalid(&path, "scatter3d requires bind_x/bind_y/bind_z"));
        }

        let max_points = match chart.get("max_points") {
            None | Some(Value::Null) => 1000,
            Some(v) => v
                .as_i64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| ScriptError::invalid(format!("{path}.max_points"), "must be a positive integer"))?,
        };

        charts.push(ChartSpec {
            title: text(chart.get("title")).unwrap_or_else(|| id.clone()),
            id,
            bind,
            chart_type,
            bind_x,
            bind_y,
            bind_z,
            group,
            separate,
            max_points,
        });
    }
    Ok(charts)
}

fn parse_controls(section: Option<&Value>) -> Result<Vec<ControlSpec>, ScriptError> {
    let mut controls = Vec::new();
    for (idx, item) in list_items(section, "ui.controls")?.iter().enumerate() {
        let path = format!("ui.controls[{idx}]");
        let Value::Map(control) = item else {
            return Err(ScriptError::invalid(path, "must be a mapping"));
        };
        let id = text(control.get("id")).unwrap_or_else(|| format!("control_{idx}"));

        let mut inputs = Vec::new();
        for (jdx, input) in list_items(control.get("inputs"), &format!("{path}.inputs"))?
            .iter()
            .enumerate()
        {
            let ipath = format!("{path}.inputs[{jdx}]");
            let Value::Map(input) = input else {
                return Err(ScriptError::invalid(ipath, "must be a mapping"));
            };
            let name = text(input.get("name")).ok_or_else(|| ScriptError::invalid(&ipath, "missing name"))?;
            let input_type = text(input.get("type"))
                .unwrap_or_else(|| "float".to_string())
                .to_lowercase();
            let options = match input.get("options") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::List(opts)) => opts.iter().map(ToString::to_string).collect(),
                Some(_) if input_type == "select" => {
                    return Err(ScriptError::invalid(format!("{ipath}.options"), "must be a list"))
                }
                Some(_) => Vec::new(),
            };
            inputs.push(ControlInput {
                label: text(input.get("label")).unwrap_or_else(|| name.clone()),
                name,
                input_type,
                min: input.get("min").and_then(Value::as_f64),
                max: input.get("max").and_then(Value::as_f64),
                step: input.get("step").and_then(Value::as_f64),
                default: input.get("default").cloned().unwrap_or_default(),
                options,
                placeholder: text(input.get("placeholder")),
            });
        }

        let mut actions = Vec::new();
        match control.get("actions") {
            None | Some(Value::Null) => {}
            Some(Value::Map(defs)) => {
                for (name, def) in defs {
                    let apath = format!("{path}.actions.{name}");
                    let Value::Map(def) = def else {
                        return Err(ScriptError::invalid(apath, "must be a mapping"));
                    };
                    let emit = text(def.get("emit")).ok_or_else(|| ScriptError::invalid(&apath, "missing emit"))?;
                    actions.push(ControlAction {
                        name: name.clone(),
                        emit,
                        label: text(def.get("label")).unwrap_or_else(|| name.clone()),
                    });
                }
            }
            Some(_) => return Err(ScriptError::invalid(format!("{path}.actions"), "must be a mapping")),
        }

        controls.push(ControlSpec {
            title: text(control.get("title")).unwrap_or_else(|| id.clone()),
            id,
            separate: flag(control.get("separate"), true),
            inputs,
            actions,
        });
    }
    Ok(controls)
}

fn parse_layout_node(node: &Mapping, path: &str) -> Result<LayoutNode, ScriptError> {
    if let Some(split) = node.get("split") {
        let orientation = match split.to_string().to_lowercase().as_str() {
            "horizontal" => Orientation::Horizontal,
            "vertical" => Orientation::Vertical,
            other => {
                return Err(ScriptError::invalid(path, format!("invalid split orientation: {other}")))
            }
        };
        let mut children = Vec::new();
        for key in ["left", "right", "top", "bottom", "children"] {
            let child_path = format!("{path}.{key}");
            match node.get(key) {
                None | Some(Value::Null) => {}
                Some(Value::List(items)) if key == "children" => {
                    for (idx, item) in items.iter().enumerate() {
                        let Value::Map(child) = item else {
                            return Err(ScriptError::invalid(format!("{child_path}[{idx}]"), "must be a mapping"));
                        };
                        children.push(parse_layout_node(child, &format!("{child_path}[{idx}]"))?);
                    }
                }
                Some(_) if key == "children" => {
                    return Err(ScriptError::invalid(child_path, "must be a list"))
                }
                Some(Value::Map(child)) if !child.is_empty() => {
                    children.push(parse_layout_node(child, &child_path)?);
                }
                Some(Value::Map(_)) => {}
                Some(_) => return Err(ScriptError::invalid(child_path, "must be a mapping")),
            }
        }
        if children.is_empty() {
            return Err(ScriptError::invalid(path, "split requires children"));
        }
        return Ok(LayoutNode::Split {
            orientation,
            children,
        });
    }

    let names = |key: &str| -> Result<Vec<String>, ScriptError> {
        Ok(list_items(node.get(key), &format!("{path}.{key}"))?
            .iter()
            .map(ToString::to_string)
            .collect())
    };
    let charts = names("charts")?;
    let controls = names("controls")?;
    if charts.is_empty() && controls.is_empty() {
        return Err(ScriptError::invalid(path, "leaf requires charts or controls"));
    }
    Ok(LayoutNode::Leaf { charts, controls })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
state_machine:
  initial: A
  states:
    A: { goto: B }
    B: {}
";

    #[test]
    fn test_minimal_script() {
        let ast = parse(MINIMAL).unwrap();
        assert_eq!(ast.version, 1);
        assert_eq!(ast.state_machine.initial, "A");
        assert_eq!(ast.state_machine.states["A"].goto.as_deref(), Some("B"));
        assert!(ast.state_machine.states["B"].is_terminal());
        assert!(ast.channels.is_empty());
    }

    #[test]
    fn test_actions_alias_for_do() {
        let src = "state_machine:\n  initial: A\n  states:\n    A:\n      actions:\n        - log: hi\n";
        let ast = parse(src).unwrap();
        assert_eq!(ast.state_machine.states["A"].actions[0].name, "log");
    }

    #[test]
    fn test_missing_or_undeclared_initial() {
        let missing = "state_machine:\n  states:\n    A: {}\n";
        assert_eq!(parse(missing).unwrap_err(), ScriptError::InvalidInitial);
        let undeclared = "state_machine:\n  initial: Z\n  states:\n    A: {}\n";
        assert_eq!(parse(undeclared).unwrap_err(), ScriptError::InvalidInitial);
    }

    #[test]
    fn test_action_shorthands() {
        let src = r"
state_machine:
  initial: A
  states:
    A:
      do:
        - action: modbus_read
          args: { address: 0 }
        - set: { x: 1 }
        - log: hello
        - wait: 100
        - wait_for_event: start
        - wait_for_event: { event: go, timeout: 50 }
        - if: { when: '$x > 0', then: [ { log: yes } ] }
";
        let ast = parse(src).unwrap();
        let actions = &ast.state_machine.states["A"].actions;
        let names: Vec<&str> = actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            ["modbus_read", "set", "log", "wait", "wait_for_event", "wait_for_event", "if"]
        );
        assert_eq!(actions[2].args["message"], Value::from("hello"));
        assert_eq!(actions[3].args["ms"], Value::Int(100));
        assert_eq!(actions[4].args["event"], Value::from("start"));
        assert_eq!(actions[5].args["timeout"], Value::Int(50));
    }

    #[test]
    fn test_unknown_action_shorthand() {
        let src = "state_machine:\n  initial: A\n  states:\n    A:\n      do:\n        - frobnicate: 1\n";
        assert!(matches!(parse(src), Err(ScriptError::Invalid { .. })));
        let src = "state_machine:\n  initial: A\n  states:\n    A:\n      do:\n        - just a string\n";
        assert!(matches!(parse(src), Err(ScriptError::Invalid { .. })));
    }

    #[test]
    fn test_channels_keep_declaration_order() {
        let src = r"
channels:
  zeta: { type: tcp, host: 127.0.0.1, port: 502 }
  alpha: { port: /dev/ttyUSB0, baudrate: 9600 }
state_machine: { initial: A, states: { A: {} } }
";
        let ast = parse(src).unwrap();
        assert_eq!(ast.default_channel(), Some("zeta"));
        assert!(matches!(ast.channels[1].config, ChannelConfig::Serial(_)));
    }

    #[test]
    fn test_chart_validation() {
        let base = "state_machine: { initial: A, states: { A: {} } }\n";
        let missing_bind = format!("{base}ui:\n  charts:\n    - {{ type: line }}\n");
        assert!(parse(&missing_bind).is_err());
        let both = format!("{base}ui:\n  charts:\n    - {{ bind: t, group: g, separate: true }}\n");
        assert!(parse(&both).is_err());
        let partial3d = format!("{base}ui:\n  charts:\n    - {{ type: Scatter3D, bind_x: x, bind_y: y }}\n");
        assert!(parse(&partial3d).is_err());

        let ok = format!("{base}ui:\n  charts:\n    - {{ type: scatter3d, bind_x: x, bind_y: y, bind_z: z }}\n");
        let ast = parse(&ok).unwrap();
        let chart = &ast.ui.charts[0];
        assert_eq!(chart.id, "chart_0");
        assert_eq!(chart.bind, "z");
        assert_eq!(chart.max_points, 1000);
    }

    #[test]
    fn test_controls_and_layout() {
        let src = r"
state_machine: { initial: A, states: { A: {} } }
ui:
  charts: [ { id: temp, bind: temp } ]
  controls:
    - id: panel
      inputs: [ { name: setpoint, min: 0, max: 100 } ]
      actions: { start: { emit: start, label: Start } }
  layout:
    split: Horizontal
    left: { charts: [temp] }
    right: { controls: [panel] }
";
        let ast = parse(src).unwrap();
        assert_eq!(ast.ui.controls[0].inputs[0].input_type, "float");
        assert_eq!(ast.ui.controls[0].actions[0].emit, "start");
        assert!(ast.ui.controls[0].separate);
        let Some(LayoutNode::Split { orientation, children }) = &ast.ui.layout else {
            panic!("expected split layout");
        };
        assert_eq!(*orientation, Orientation::Horizontal);
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_layout_errors() {
        let base = "state_machine: { initial: A, states: { A: {} } }\n";
        let no_children = format!("{base}ui:\n  layout: {{ split: vertical }}\n");
        assert!(parse(&no_children).is_err());
        let bad_orientation = format!("{base}ui:\n  layout: {{ split: diagonal, left: {{ charts: [a] }} }}\n");
        assert!(parse(&bad_orientation).is_err());
        let empty_leaf = format!("{base}ui:\n  layout: {{ charts: [] }}\n");
        assert!(parse(&empty_leaf).is_err());
        let no_emit = format!("{base}ui:\n  controls:\n    - actions: {{ go: {{ label: Go }} }}\n");
        assert!(parse(&no_emit).is_err());
    }

    #[test]
    fn test_task_list_forms() {
        let tasks = parse_task_list(
            r#"
vars: { addr: 4 }
tasks:
  - action: modbus_read
    address: $addr
  - action: send
    args: { hex: "01" }
  - log: hello
"#,
        )
        .unwrap();
        assert_eq!(tasks.vars.get("addr"), Some(&Value::Int(4)));
        assert_eq!(tasks.tasks.len(), 3);
        assert_eq!(tasks.tasks[0].name, "modbus_read");
        assert_eq!(tasks.tasks[0].args.get("address"), Some(&Value::from("$addr")));
        assert_eq!(tasks.tasks[1].args.get("hex"), Some(&Value::from("01")));
        assert_eq!(tasks.tasks[2].name, "log");

        assert!(parse_task_list("tasks: 3").is_err());
        assert!(parse_task_list("vars: {}").unwrap().tasks.is_empty());
    }

    #[test]
    fn test_dangling_targets() {
        let src = "state_machine:\n  initial: A\n  states:\n    A: { goto: B, else_goto: C, when: '$x' }\n    B: {}\n";
        let ast = parse(src).unwrap();
        assert_eq!(ast.dangling_targets(), vec![("A".to_string(), "C".to_string())]);
    }
}
