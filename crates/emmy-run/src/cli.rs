use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use emmy_core::transport::TcpConnector;
use emmy_core::{CancellationToken, DebuggerConfig, DebuggerError, Facade, SessionGuard, log};
use miette::miette;
use mlua::Lua;
use tracing::{info, warn};

#[derive(Parser, Debug, Default)]
#[command(name = "emmy-run")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(after_help = "# Examples:\n\n\
    ## To run a script that connects itself with require('emmy_core').tcpConnect:\n\
    emmy-run script.lua\n\n\
    ## To connect to the IDE before the script starts:\n\
    emmy-run --connect --port 9966 script.lua")]
#[command(
    about = "Run a Lua script with the emmy_core debugger module preloaded.",
    long_about = None
)]
pub struct Cli {
    /// Lua script to run
    script: PathBuf,

    /// Host the IDE debug server listens on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port the IDE debug server listens on
    #[arg(short, long, default_value_t = 9966)]
    port: u16,

    /// Connect to the IDE and wait for it before running the script
    #[arg(long, default_value_t = false)]
    connect: bool,

    /// Debugger settings in TOML
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    pub fn run(&self) -> miette::Result<()> {
        let config = match &self.config {
            Some(path) => DebuggerConfig::load(path)?,
            None => DebuggerConfig::default(),
        };
        let console = log::init(&config);

        let source = fs::read_to_string(&self.script)
            .map_err(|e| miette!("Failed to read {}: {}", self.script.display(), e))?;

        // SAFETY: the debugger needs the `debug` library, which `Lua::new` leaves out.
        let lua = unsafe { Lua::unsafe_new() };
        let facade = Arc::new(Facade::new(
            config.clone(),
            Arc::new(SessionGuard::new()),
            Arc::new(TcpConnector::new(config.connect_timeout())),
        ));
        if let Some(console) = console {
            facade.forward_logs(console)?;
        }

        let cancel = CancellationToken::new();
        emmy_core::preload(&lua, Arc::clone(&facade), cancel.clone())?;

        if self.connect {
            let outcome = facade.connect(&lua, &self.host, self.port, &cancel)?;
            info!(?outcome, host = %self.host, port = self.port, "Connected to IDE");
        }

        let result = lua
            .load(source.as_str())
            .set_name(format!("@{}", self.script.display()))
            .exec();

        if let Err(e) = facade.close() {
            warn!(error = %e, "Failed to close debug session");
        }
        result.map_err(DebuggerError::from)?;
        Ok(())
    }
}
