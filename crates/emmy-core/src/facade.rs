//! Session lifecycle: connect, dispatch, notifications and teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::Receiver;
use mlua::Lua;
use parking_lot::Mutex;
use tracing::{Level, debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::DebuggerConfig;
use crate::engine::{DebugEventSink, Debugger, EvalContext, InterpreterId};
use crate::error::DebuggerError;
use crate::log::{ConsoleLine, TRANSPORT_TARGET};
use crate::protocol::{BreakNotify, InboundMessage, LogNotify, OutboundMessage, StackFrame};
use crate::session::{SessionGuard, SessionSynchronizer, WaitOutcome};
use crate::transport::{Connector, EventHandler, Transport, TransportEvent};

/// `LogNotify` type values understood by the IDE console.
mod log_type {
    pub const INFO: i32 = 0;
    pub const WARNING: i32 = 1;
    pub const ERROR: i32 = 2;
}

/// Entry point of the debugger: owns one engine and at most one open session.
pub struct Facade {
    inner: Arc<FacadeInner>,
}

struct FacadeInner {
    config: DebuggerConfig,
    guard: Arc<SessionGuard>,
    connector: Arc<dyn Connector>,
    engine: Arc<Debugger>,
    synchronizer: SessionSynchronizer,
    next_session: AtomicU64,
    session: Mutex<Option<OpenSession>>,
}

struct OpenSession {
    id: u64,
    transport: Arc<dyn Transport>,
}

impl Facade {
    pub fn new(
        config: DebuggerConfig,
        guard: Arc<SessionGuard>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<FacadeInner>| {
            let sink: Weak<dyn DebugEventSink> = weak.clone();
            FacadeInner {
                engine: Arc::new(Debugger::new(&config, sink)),
                synchronizer: SessionSynchronizer::new(config.wake_interval()),
                next_session: AtomicU64::new(1),
                session: Mutex::new(None),
                config,
                guard,
                connector,
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<Debugger> {
        &self.inner.engine
    }

    /// Opens a session to the IDE at `host:port`, registers `lua` and blocks
    /// until the IDE is ready or the wait ends otherwise.
    ///
    /// Must be called on the thread running `lua`. Fails with
    /// [`DebuggerError::SessionActive`] while any session sharing the same
    /// guard is open.
    pub fn connect(
        &self,
        lua: &Lua,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, DebuggerError> {
        let inner = &self.inner;
        if !inner.guard.try_acquire() {
            warn!(host, port, "Rejecting connect, a debug session is already active");
            return Err(DebuggerError::SessionActive);
        }

        inner.synchronizer.reset();
        let session_id = inner.next_session.fetch_add(1, Ordering::Relaxed);
        let handler: EventHandler = {
            let weak = Arc::downgrade(inner);
            Arc::new(move |event: TransportEvent| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    TransportEvent::Message(message) => inner.dispatch(message),
                    TransportEvent::Closed => inner.on_disconnect(session_id),
                }
            })
        };
        let transport = match inner.connector.connect(host, port, handler) {
            Ok(transport) => transport,
            Err(e) => {
                inner.guard.release();
                warn!(host, port, error = %e, "Failed to open debug session");
                return Err(e);
            }
        };
        *inner.session.lock() = Some(OpenSession {
            id: session_id,
            transport,
        });
        info!(host, port, "Debug session opened");

        if let Err(e) = inner.engine.register(lua) {
            inner.close()?;
            return Err(e);
        }

        let outcome = inner
            .synchronizer
            .wait_for_ready(cancel, inner.config.ready_timeout());
        debug!(?outcome, "Finished waiting for IDE");
        Ok(outcome)
    }

    /// Adds another interpreter to the open session. Must be called on the
    /// thread running `lua`.
    pub fn attach_interpreter(&self, lua: &Lua) -> Result<InterpreterId, DebuggerError> {
        if !self.is_connected() {
            return Err(DebuggerError::NotConnected);
        }
        self.inner.engine.register(lua)
    }

    pub fn dispatch(&self, message: InboundMessage) {
        self.inner.dispatch(message);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.synchronizer.is_ready()
    }

    /// Sends every line received on `rx` to the IDE console while a session
    /// is open. The forwarding thread ends with the channel or the facade.
    pub fn forward_logs(&self, rx: Receiver<ConsoleLine>) -> Result<(), DebuggerError> {
        let weak = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("emmy-log-forward".to_string())
            .spawn(move || {
                for line in rx.iter() {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if inner.session.lock().is_some() {
                        inner.send(OutboundMessage::Log(LogNotify {
                            log_type: log_type_of(line.level),
                            message: line.message,
                        }));
                    }
                }
            })?;
        Ok(())
    }

    /// Ends the open session, if any: paused threads are released, the
    /// guard is freed and the transport closed. Safe to call repeatedly.
    pub fn close(&self) -> Result<(), DebuggerError> {
        self.inner.close()
    }
}

impl Drop for Facade {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            warn!(error = %e, "Failed to close debug session");
        }
    }
}

impl std::fmt::Debug for Facade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Facade")
            .field("connected", &self.is_connected())
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}

impl FacadeInner {
    fn dispatch(&self, message: InboundMessage) {
        match message {
            InboundMessage::Init(req) => {
                self.engine.start(&req.emmy_helper, req.ext);
                self.engine.attach_all();
            }
            InboundMessage::Ready(_) => {
                debug!("IDE is ready");
                self.synchronizer.mark_ready();
            }
            InboundMessage::AddBreakPoint(req) => self.engine.apply_add_breakpoints(&req),
            InboundMessage::RemoveBreakPoint(req) => self.engine.apply_remove_breakpoints(&req),
            InboundMessage::Action(req) => self.engine.do_action(req.action),
            InboundMessage::Eval(req) => self.engine.eval(EvalContext::from(req)),
            InboundMessage::Unknown(cmd) => {
                warn!(cmd, "Dropping message with unknown command id");
            }
        }
    }

    /// Send failures are logged under the transport target so they are never
    /// forwarded to the IDE themselves.
    fn send(&self, message: OutboundMessage) {
        let transport = self
            .session
            .lock()
            .as_ref()
            .map(|session| Arc::clone(&session.transport));
        match transport {
            Some(transport) => {
                if let Err(e) = transport.send(&message) {
                    warn!(target: TRANSPORT_TARGET, cmd = message.cmd(), error = %e, "Failed to send message");
                }
            }
            None => debug!(target: TRANSPORT_TARGET, cmd = message.cmd(), "No open session, dropping message"),
        }
    }

    fn close(&self) -> Result<(), DebuggerError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        self.teardown(session)
    }

    /// Closes the session only if it is still the one whose transport hung up.
    fn on_disconnect(&self, session_id: u64) {
        let session = {
            let mut current = self.session.lock();
            match current.as_ref() {
                Some(session) if session.id == session_id => current.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };
        info!("IDE disconnected");
        if let Err(e) = self.teardown(session) {
            warn!(target: TRANSPORT_TARGET, error = %e, "Failed to close debug session");
        }
    }

    fn teardown(&self, session: OpenSession) -> Result<(), DebuggerError> {
        self.engine.shutdown();
        self.synchronizer.close();
        self.guard.release();
        info!("Debug session closed");
        session.transport.close()
    }
}

impl DebugEventSink for FacadeInner {
    fn on_break(&self, frames: Vec<StackFrame>) {
        self.send(OutboundMessage::Break(BreakNotify { stacks: frames }));
    }

    fn on_eval_result(&self, ctx: EvalContext) {
        self.send(OutboundMessage::EvalResult(ctx.into_response()));
    }
}

fn log_type_of(level: Level) -> i32 {
    match level {
        Level::ERROR => log_type::ERROR,
        Level::WARN => log_type::WARNING,
        _ => log_type::INFO,
    }
}
