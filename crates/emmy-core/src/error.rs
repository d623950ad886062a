use std::{fmt, io};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("A debug session is already active in this process")]
    SessionActive,
    #[error("Failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("No debug session is open")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Failed to decode message {cmd}: {source}")]
    Decode {
        cmd: i32,
        #[source]
        source: serde_json::Error,
    },
    #[error("Evaluation error: {0}")]
    Eval(String),
    #[error("debugger is not paused")]
    NotPaused,
    #[error("The interpreter does not expose the debug library")]
    MissingDebugLibrary,
    #[error(transparent)]
    Lua(#[from] mlua::Error),
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DebuggerError {
    fn code_str(&self) -> &'static str {
        match self {
            DebuggerError::SessionActive => "emmy::session_active",
            DebuggerError::Connection { .. } => "emmy::connection",
            DebuggerError::NotConnected => "emmy::not_connected",
            DebuggerError::Protocol(_) => "emmy::protocol",
            DebuggerError::Decode { .. } => "emmy::decode",
            DebuggerError::Eval(_) => "emmy::eval",
            DebuggerError::NotPaused => "emmy::not_paused",
            DebuggerError::MissingDebugLibrary => "emmy::missing_debug_library",
            DebuggerError::Lua(_) => "emmy::lua",
            DebuggerError::Io(_) => "emmy::io",
            DebuggerError::Config(_) => "emmy::config",
        }
    }
}

impl miette::Diagnostic for DebuggerError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code_str()))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        match self {
            DebuggerError::SessionActive => Some(Box::new(
                "close the open session before connecting again",
            )),
            DebuggerError::MissingDebugLibrary => Some(Box::new(
                "create the Lua state with the `debug` standard library loaded",
            )),
            _ => None,
        }
    }
}
