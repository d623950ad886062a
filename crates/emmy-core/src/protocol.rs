use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DebuggerError;

/// Numeric command ids carried by every protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageCmd {
    InitReq = 1,
    ReadyReq = 3,
    AddBreakPointReq = 5,
    RemoveBreakPointReq = 7,
    ActionReq = 9,
    EvalReq = 11,
    EvalRsp = 12,
    BreakNotify = 13,
    LogNotify = 17,
}

impl MessageCmd {
    pub fn id(self) -> i32 {
        self as i32
    }
}

/// Actions the IDE can apply to a paused (or running, for `Break`) thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Action {
    /// Pause every running thread at its next line.
    Break,
    Continue,
    StepOver,
    StepInto,
    StepOut,
    /// Release every paused thread and disarm the hooks.
    Stop,
}

impl TryFrom<i32> for Action {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Action::Break),
            1 => Ok(Action::Continue),
            2 => Ok(Action::StepOver),
            3 => Ok(Action::StepInto),
            4 => Ok(Action::StepOut),
            5 => Ok(Action::Stop),
            n => Err(format!("unknown action {}", n)),
        }
    }
}

impl From<Action> for i32 {
    fn from(action: Action) -> Self {
        match action {
            Action::Break => 0,
            Action::Continue => 1,
            Action::StepOver => 2,
            Action::StepInto => 3,
            Action::StepOut => 4,
            Action::Stop => 5,
        }
    }
}

/// Wire form of a single variable, possibly with expanded children.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub name_type: i32,
    pub value: String,
    pub value_type: i32,
    pub value_type_name: String,
    /// Non-zero when the value can be expanded later through an `EvalReq`.
    #[serde(default)]
    pub cache_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Variable>>,
}

/// Snapshot of one call stack level taken at pause time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub level: usize,
    pub file: String,
    pub function_name: String,
    pub line: i64,
    pub local_variables: Vec<Variable>,
    pub upvalue_variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakPointProto {
    pub file: String,
    pub line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReq {
    #[serde(default)]
    pub emmy_helper: String,
    #[serde(default)]
    pub ext: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadyReq {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBreakPointReq {
    #[serde(default)]
    pub clear: bool,
    #[serde(default)]
    pub break_points: Vec<BreakPointProto>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBreakPointReq {
    #[serde(default)]
    pub break_points: Vec<BreakPointProto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReq {
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalReq {
    pub expr: String,
    pub seq: i64,
    #[serde(default)]
    pub stack_level: usize,
    #[serde(default)]
    pub depth: usize,
    #[serde(default)]
    pub cache_id: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakNotify {
    pub stacks: Vec<StackFrame>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvalRsp {
    pub seq: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Variable>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogNotify {
    #[serde(rename = "type")]
    pub log_type: i32,
    pub message: String,
}

/// Messages sent from the IDE to the debugger.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Init(InitReq),
    Ready(ReadyReq),
    AddBreakPoint(AddBreakPointReq),
    RemoveBreakPoint(RemoveBreakPointReq),
    Action(ActionReq),
    Eval(EvalReq),
    /// A command id this debugger does not understand.
    Unknown(i32),
}

impl InboundMessage {
    /// Decodes a payload according to its command id.
    pub fn decode(cmd: i32, payload: &str) -> Result<Self, DebuggerError> {
        fn parse<T: serde::de::DeserializeOwned>(cmd: i32, payload: &str) -> Result<T, DebuggerError> {
            serde_json::from_str(payload).map_err(|source| DebuggerError::Decode { cmd, source })
        }

        let message = match cmd {
            c if c == MessageCmd::InitReq.id() => InboundMessage::Init(parse(cmd, payload)?),
            c if c == MessageCmd::ReadyReq.id() => InboundMessage::Ready(parse(cmd, payload)?),
            c if c == MessageCmd::AddBreakPointReq.id() => {
                InboundMessage::AddBreakPoint(parse(cmd, payload)?)
            }
            c if c == MessageCmd::RemoveBreakPointReq.id() => {
                InboundMessage::RemoveBreakPoint(parse(cmd, payload)?)
            }
            c if c == MessageCmd::ActionReq.id() => InboundMessage::Action(parse(cmd, payload)?),
            c if c == MessageCmd::EvalReq.id() => InboundMessage::Eval(parse(cmd, payload)?),
            other => InboundMessage::Unknown(other),
        };
        Ok(message)
    }

    pub fn cmd(&self) -> i32 {
        match self {
            InboundMessage::Init(_) => MessageCmd::InitReq.id(),
            InboundMessage::Ready(_) => MessageCmd::ReadyReq.id(),
            InboundMessage::AddBreakPoint(_) => MessageCmd::AddBreakPointReq.id(),
            InboundMessage::RemoveBreakPoint(_) => MessageCmd::RemoveBreakPointReq.id(),
            InboundMessage::Action(_) => MessageCmd::ActionReq.id(),
            InboundMessage::Eval(_) => MessageCmd::EvalReq.id(),
            InboundMessage::Unknown(cmd) => *cmd,
        }
    }

    /// Encodes the payload with the `cmd` field, the way the IDE sends it.
    pub fn encode(&self) -> Result<String, DebuggerError> {
        let payload = match self {
            InboundMessage::Init(req) => serde_json::to_value(req),
            InboundMessage::Ready(req) => serde_json::to_value(req),
            InboundMessage::AddBreakPoint(req) => serde_json::to_value(req),
            InboundMessage::RemoveBreakPoint(req) => serde_json::to_value(req),
            InboundMessage::Action(req) => serde_json::to_value(req),
            InboundMessage::Eval(req) => serde_json::to_value(req),
            InboundMessage::Unknown(_) => Ok(JsonValue::Object(Default::default())),
        };
        with_cmd(self.cmd(), payload)
    }
}

/// Messages sent from the debugger to the IDE.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Break(BreakNotify),
    EvalResult(EvalRsp),
    Log(LogNotify),
}

impl OutboundMessage {
    pub fn cmd(&self) -> i32 {
        match self {
            OutboundMessage::Break(_) => MessageCmd::BreakNotify.id(),
            OutboundMessage::EvalResult(_) => MessageCmd::EvalRsp.id(),
            OutboundMessage::Log(_) => MessageCmd::LogNotify.id(),
        }
    }

    pub fn encode(&self) -> Result<String, DebuggerError> {
        let payload = match self {
            OutboundMessage::Break(notify) => serde_json::to_value(notify),
            OutboundMessage::EvalResult(rsp) => serde_json::to_value(rsp),
            OutboundMessage::Log(notify) => serde_json::to_value(notify),
        };
        with_cmd(self.cmd(), payload)
    }

    pub fn decode(cmd: i32, payload: &str) -> Result<Self, DebuggerError> {
        let decode_err = |source| DebuggerError::Decode { cmd, source };
        match cmd {
            c if c == MessageCmd::BreakNotify.id() => {
                serde_json::from_str(payload).map(OutboundMessage::Break).map_err(decode_err)
            }
            c if c == MessageCmd::EvalRsp.id() => {
                serde_json::from_str(payload).map(OutboundMessage::EvalResult).map_err(decode_err)
            }
            c if c == MessageCmd::LogNotify.id() => {
                serde_json::from_str(payload).map(OutboundMessage::Log).map_err(decode_err)
            }
            other => Err(DebuggerError::Protocol(format!("Unexpected outbound command {}", other))),
        }
    }
}

fn with_cmd(cmd: i32, payload: serde_json::Result<JsonValue>) -> Result<String, DebuggerError> {
    let mut payload = payload.map_err(|source| DebuggerError::Decode { cmd, source })?;
    if let JsonValue::Object(map) = &mut payload {
        map.insert("cmd".to_string(), JsonValue::from(cmd));
    }
    serde_json::to_string(&payload).map_err(|source| DebuggerError::Decode { cmd, source })
}
