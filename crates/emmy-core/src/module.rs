use std::sync::Arc;

use mlua::{Lua, Table};
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::DebuggerError;
use crate::facade::Facade;

/// Registers the debugger module in `package.preload` under the configured
/// module name, so scripts can `require` it:
///
/// ```lua
/// local dbg = require("emmy_core")
/// local ok, err = dbg.tcpConnect("localhost", 9966)
/// ```
///
/// `tcpConnect` returns `true` once the wait for the IDE has ended, or
/// `false` and an error message. The host keeps `facade` to close the session
/// on teardown; `cancel` interrupts a pending wait.
pub fn preload(lua: &Lua, facade: Arc<Facade>, cancel: CancellationToken) -> Result<(), DebuggerError> {
    let module_name = facade.config().module_name.clone();
    let loader = lua.create_function(move |lua, _: mlua::MultiValue| {
        let module = lua.create_table()?;
        let facade = Arc::clone(&facade);
        let cancel = cancel.clone();
        module.set(
            "tcpConnect",
            lua.create_function(move |lua, (host, port): (String, u16)| {
                match facade.connect(lua, &host, port, &cancel) {
                    Ok(outcome) => {
                        debug!(?outcome, "tcpConnect finished");
                        Ok((true, None::<String>))
                    }
                    Err(e) => Ok((false, Some(e.to_string()))),
                }
            })?,
        )?;
        Ok(module)
    })?;

    let package: Table = lua.globals().get("package")?;
    let preload: Table = package.get("preload")?;
    preload.set(module_name, loader)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebuggerConfig;
    use crate::session::SessionGuard;
    use crate::transport::ChannelConnector;

    fn facade(connector: ChannelConnector) -> Arc<Facade> {
        Arc::new(Facade::new(
            DebuggerConfig::default(),
            Arc::new(SessionGuard::new()),
            Arc::new(connector),
        ))
    }

    #[test]
    fn test_require_exposes_tcp_connect() {
        let lua = unsafe { Lua::unsafe_new() };
        preload(&lua, facade(ChannelConnector::refusing()), CancellationToken::new()).unwrap();

        let kind: String = lua
            .load("return type(require('emmy_core').tcpConnect)")
            .eval()
            .unwrap();
        assert_eq!(kind, "function");
    }

    #[test]
    fn test_tcp_connect_reports_failure() {
        let lua = unsafe { Lua::unsafe_new() };
        preload(&lua, facade(ChannelConnector::refusing()), CancellationToken::new()).unwrap();

        let (ok, err): (bool, Option<String>) = lua
            .load("return require('emmy_core').tcpConnect('127.0.0.1', 9966)")
            .eval()
            .unwrap();
        assert!(!ok);
        assert!(err.unwrap().contains("127.0.0.1:9966"));
    }

    #[test]
    fn test_tcp_connect_cancelled_wait_succeeds() {
        let (connector, _peers) = ChannelConnector::new();
        let facade = facade(connector);
        let lua = unsafe { Lua::unsafe_new() };
        preload(&lua, Arc::clone(&facade), CancellationToken::cancelled()).unwrap();

        let ok: bool = lua
            .load("return (require('emmy_core').tcpConnect('127.0.0.1', 9966))")
            .eval()
            .unwrap();
        assert!(ok);
        assert!(facade.is_connected());
        facade.close().unwrap();
    }
}
