//! Message vocabulary exchanged between host and worker.
use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Commands the host sends to a paused worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Step,
    Next,
    Continue,
    Return,
    Quit,
    Eval { expression: String },
    ExecInteractive { code: String },
    AddBreakpoint { file: PathBuf, line: u32 },
    RemoveBreakpoint { file: PathBuf, line: u32 },
}

impl Command {
    /// Whether the command ends the current pause.
    pub fn is_resuming(&self) -> bool {
        matches!(
            self,
            Command::Step | Command::Next | Command::Continue | Command::Return | Command::Quit
        )
    }
}

/// Everything the host can write to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum HostMessage {
    /// First frame of every session.
    Launch(LaunchArguments),
    Command(Command),
    /// Answer to an [`Event::InputRequest`]. `None` means the prompt was
    /// cancelled and the read resolves as end of input.
    InputResponse { id: String, text: Option<String> },
    /// The host is going away.
    Finished,
}

/// Everything the worker can write to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Line {
        file: PathBuf,
        line: u32,
    },
    Stack {
        frames: Vec<Frame>,
    },
    Variables {
        locals: BTreeMap<String, SerializedValue>,
        globals: BTreeMap<String, SerializedValue>,
    },
    #[serde(rename = "stdout")]
    StdOut {
        text: String,
    },
    #[serde(rename = "stderr")]
    StdErr {
        text: String,
    },
    InputRequest {
        id: String,
        prompt: String,
    },
    EvalResult {
        expression: String,
        repr: String,
        success: bool,
    },
    InteractiveResult {
        code: String,
        stdout: String,
        stderr: String,
        success: bool,
        error: Option<String>,
    },
    BreakpointStatus {
        action: BreakpointAction,
        file: PathBuf,
        line: u32,
        error: Option<String>,
    },
    Finished,
}

/// One entry of a stack snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub file: PathBuf,
    pub line: u32,
    pub function: String,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.function, self.file.display(), self.line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointAction {
    Added,
    AddFailed,
    Removed,
    RemoveFailed,
}

impl BreakpointAction {
    pub fn is_failure(self) -> bool {
        matches!(self, BreakpointAction::AddFailed | BreakpointAction::RemoveFailed)
    }
}

/// Transmit-safe form of a live debuggee value.
///
/// Summaries (`table[3]`) and sentinels ([`SerializedValue::CYCLE`],
/// [`SerializedValue::MAX_DEPTH`], `<error: ...>`) travel as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    Sequence(Vec<SerializedValue>),
    Mapping(BTreeMap<String, SerializedValue>),
}

impl SerializedValue {
    pub const CYCLE: &'static str = "<cycle>";
    pub const MAX_DEPTH: &'static str = "<max depth>";

    pub fn cycle() -> Self {
        SerializedValue::Text(Self::CYCLE.to_string())
    }

    pub fn max_depth() -> Self {
        SerializedValue::Text(Self::MAX_DEPTH.to_string())
    }

    pub fn error(reason: impl fmt::Display) -> Self {
        SerializedValue::Text(format!("<error: {reason}>"))
    }
}

impl fmt::Display for SerializedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializedValue::Null => f.write_str("nil"),
            SerializedValue::Bool(b) => write!(f, "{b}"),
            SerializedValue::Integer(i) => write!(f, "{i}"),
            SerializedValue::Number(n) => write!(f, "{n}"),
            SerializedValue::Text(s) => f.write_str(s),
            SerializedValue::Sequence(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            SerializedValue::Mapping(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceBreakpoint {
    pub file: PathBuf,
    pub line: u32,
}

/// Spawn contract sent as the first frame of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchArguments {
    pub script: PathBuf,
    #[serde(default)]
    pub breakpoints: Vec<SourceBreakpoint>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub stop_on_entry: bool,
    #[serde(default)]
    pub options: WorkerOptions,
}

impl LaunchArguments {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            breakpoints: Vec::new(),
            args: Vec::new(),
            working_directory: None,
            stop_on_entry: false,
            options: WorkerOptions::default(),
        }
    }
}

/// Tunables for snapshots and frame filtering inside the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    pub max_depth: usize,
    pub max_repr_len: usize,
    pub max_stack_depth: usize,
    pub hide_builtin_globals: bool,
    pub skip_non_file_sources: bool,
    pub skip_prefixes: Vec<PathBuf>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_repr_len: 100,
            max_stack_depth: 50,
            hide_builtin_globals: true,
            skip_non_file_sources: true,
            skip_prefixes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_names() {
        let json = serde_json::to_value(Command::Eval {
            expression: "2+2".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "eval", "expression": "2+2"}));

        let json = serde_json::to_value(Command::ExecInteractive {
            code: "x = 1".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "exec_interactive");

        let json = serde_json::to_value(Command::Return).unwrap();
        assert_eq!(json, serde_json::json!({"type": "return"}));
    }

    #[test]
    fn event_wire_names() {
        let json = serde_json::to_value(Event::StdOut {
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "stdout", "text": "hi"}));

        let json = serde_json::to_value(Event::Finished).unwrap();
        assert_eq!(json, serde_json::json!({"type": "finished"}));

        let json = serde_json::to_value(Event::BreakpointStatus {
            action: BreakpointAction::AddFailed,
            file: PathBuf::from("a.lua"),
            line: 3,
            error: Some("no such line".to_string()),
        })
        .unwrap();
        assert_eq!(json["action"], "add_failed");
    }

    #[test]
    fn host_message_wraps_commands() {
        let message = HostMessage::Command(Command::Step);
        let json = serde_json::to_string(&message).unwrap();
        let back: HostMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);

        let cancelled: HostMessage = serde_json::from_value(serde_json::json!({
            "type": "input_response",
            "body": {"id": "abc", "text": null},
        }))
        .unwrap();
        assert_eq!(
            cancelled,
            HostMessage::InputResponse {
                id: "abc".to_string(),
                text: None
            }
        );
    }

    #[test]
    fn launch_arguments_fill_defaults() {
        let message: HostMessage = serde_json::from_value(serde_json::json!({
            "type": "launch",
            "body": {"script": "/tmp/main.lua"},
        }))
        .unwrap();
        let HostMessage::Launch(args) = message else {
            panic!("expected launch, got {message:?}");
        };
        assert_eq!(args.options, WorkerOptions::default());
        assert!(!args.stop_on_entry);
        assert!(args.breakpoints.is_empty());
    }

    #[test]
    fn serialized_values_stay_untagged() {
        let value = SerializedValue::Mapping(BTreeMap::from([
            ("n".to_string(), SerializedValue::Integer(5)),
            ("f".to_string(), SerializedValue::Number(1.5)),
            (
                "l".to_string(),
                SerializedValue::Sequence(vec![
                    SerializedValue::Integer(1),
                    SerializedValue::Null,
                    SerializedValue::cycle(),
                ]),
            ),
        ]));
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"f": 1.5, "l": [1, null, "<cycle>"], "n": 5})
        );
        let back: SerializedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn serialized_value_display() {
        let value = SerializedValue::Sequence(vec![
            SerializedValue::Integer(1),
            SerializedValue::Text("table[2]".to_string()),
        ]);
        assert_eq!(value.to_string(), "[1, table[2]]");
        assert_eq!(SerializedValue::error("boom").to_string(), "<error: boom>");
    }
}
