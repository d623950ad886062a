use std::io::{self, Write};

use crossbeam_channel::{Receiver, Sender};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, filter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::DebuggerConfig;

/// Environment variable overriding `DebuggerConfig::log_filter`.
pub const LOG_ENV: &str = "EMMY_LOG";

/// Target prefix excluded from the IDE console so forwarding cannot loop.
pub const TRANSPORT_TARGET: &str = "emmy_core::transport";

/// One formatted event bound for the IDE console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub level: Level,
    pub message: String,
}

/// `MakeWriter` handing out one [`ConsoleWriter`] per event, tagged with the
/// event's level.
#[derive(Clone)]
pub struct IdeConsoleWriter {
    sender: Sender<ConsoleLine>,
}

impl IdeConsoleWriter {
    pub fn new() -> (Self, Receiver<ConsoleLine>) {
        let (sender, rx) = crossbeam_channel::unbounded();
        (Self { sender }, rx)
    }
}

pub struct ConsoleWriter {
    sender: Sender<ConsoleLine>,
    level: Level,
}

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let message = String::from_utf8_lossy(buf).trim_end().to_string();
        // A closed console must not break logging.
        let _ = self.sender.send(ConsoleLine {
            level: self.level,
            message,
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for IdeConsoleWriter {
    type Writer = ConsoleWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ConsoleWriter {
            sender: self.sender.clone(),
            level: Level::INFO,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        ConsoleWriter {
            sender: self.sender.clone(),
            level: *meta.level(),
        }
    }
}

/// Installs the global subscriber: stderr always, the IDE console when
/// `forward_logs` is set. Returns the console stream to hand to
/// `Facade::forward_logs`.
///
/// Returns `None` for the stream when a global subscriber is already set.
pub fn init(config: &DebuggerConfig) -> Option<Receiver<ConsoleLine>> {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    if config.forward_logs {
        let (writer, rx) = IdeConsoleWriter::new();
        let console_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(filter::filter_fn(|meta| {
                !meta.target().starts_with(TRANSPORT_TARGET)
            }));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(console_layer)
            .try_init()
            .ok()
            .map(|_| rx)
    } else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init();
        None
    }
}
