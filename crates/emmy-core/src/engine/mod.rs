//! Breakpoint matching, pausing and stepping for attached Lua interpreters.
//!
//! Every interpreter registered with [`Debugger::register`] gets a line hook
//! that runs on the interpreter's own thread. The hook stays inert until the
//! engine is started and the interpreter attached. When it decides to stop, it
//! captures the stack, reports it through the [`DebugEventSink`] and then
//! blocks on a command channel, serving evaluations until a resume arrives.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, SendError, Sender};
use mlua::{HookTriggers, Lua, VmState};
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};
use tracing::{debug, info, warn};

use crate::breakpoint::{BreakPoint, BreakpointRegistry, normalize_path};
use crate::config::DebuggerConfig;
use crate::error::DebuggerError;
use crate::protocol::{Action, AddBreakPointReq, RemoveBreakPointReq, StackFrame};

pub mod eval;
pub mod stack;
pub mod stepping;
pub mod variable;

pub use eval::EvalContext;
pub use stepping::StepPolicy;

use stack::Introspection;
use variable::{VariableBuilder, VariableCache};

new_key_type! {
    /// Opaque handle of a registered interpreter.
    pub struct InterpreterId;
}

/// Receives what paused interpreters produce. Called on interpreter threads.
pub trait DebugEventSink: Send + Sync {
    fn on_break(&self, frames: Vec<StackFrame>);
    fn on_eval_result(&self, ctx: EvalContext);
}

#[derive(Debug, Default)]
struct InterpreterFlags {
    armed: AtomicBool,
    paused: AtomicBool,
    break_requested: AtomicBool,
}

enum Command {
    Resume(Action),
    Eval(EvalContext),
    Release,
}

struct InterpreterSlot {
    flags: Arc<InterpreterFlags>,
    command_tx: Sender<Command>,
}

#[derive(Default)]
struct EngineState {
    interpreters: SlotMap<InterpreterId, InterpreterSlot>,
    started: bool,
    stopped: bool,
    helper_code: Option<Arc<str>>,
    ext_names: Vec<String>,
    last_paused: Option<InterpreterId>,
}

/// Per-interpreter data owned by the hook closure.
struct HookState {
    id: InterpreterId,
    flags: Arc<InterpreterFlags>,
    commands: Receiver<Command>,
    introspection: Introspection,
    cache: VariableCache,
    policy: StepPolicy,
    helper_loaded: bool,
    debugger: Weak<Debugger>,
}

impl Drop for HookState {
    fn drop(&mut self) {
        if let Some(debugger) = self.debugger.upgrade() {
            debugger.unregister(self.id, &self.flags);
        }
    }
}

pub struct Debugger {
    registry: BreakpointRegistry,
    state: Mutex<EngineState>,
    sink: Weak<dyn DebugEventSink>,
    max_children: usize,
    variable_depth: usize,
}

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Debugger")
            .field("breakpoints", &self.registry.len())
            .field("interpreters", &state.interpreters.len())
            .field("started", &state.started)
            .finish_non_exhaustive()
    }
}

impl Debugger {
    pub fn new(config: &DebuggerConfig, sink: Weak<dyn DebugEventSink>) -> Self {
        Self {
            registry: BreakpointRegistry::new(),
            state: Mutex::new(EngineState::default()),
            sink,
            max_children: config.max_children,
            variable_depth: config.stack_variable_depth,
        }
    }

    pub fn registry(&self) -> &BreakpointRegistry {
        &self.registry
    }

    /// Installs the line hook on `lua`. Must be called on the thread that
    /// runs the interpreter. Registering the same interpreter again replaces
    /// its previous registration.
    pub fn register(self: &Arc<Self>, lua: &Lua) -> Result<InterpreterId, DebuggerError> {
        let introspection = Introspection::capture(lua)?;
        let flags = Arc::new(InterpreterFlags::default());
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let id = {
            let mut state = self.state.lock();
            let id = state.interpreters.insert(InterpreterSlot {
                flags: Arc::clone(&flags),
                command_tx,
            });
            if state.started && !state.stopped {
                flags.armed.store(true, Ordering::Release);
            }
            id
        };

        let hook = RefCell::new(HookState {
            id,
            flags,
            commands: command_rx,
            introspection,
            cache: VariableCache::default(),
            policy: StepPolicy::Run,
            helper_loaded: false,
            debugger: Arc::downgrade(self),
        });

        lua.set_hook(HookTriggers::new().every_line(), move |lua, debug| {
            // Re-entrant hook events (helper code, evaluation) are skipped.
            let Ok(mut state) = hook.try_borrow_mut() else {
                return Ok(VmState::Continue);
            };
            if !state.flags.armed.load(Ordering::Acquire) {
                return Ok(VmState::Continue);
            }
            let Some(debugger) = state.debugger.upgrade() else {
                return Ok(VmState::Continue);
            };

            let line = debug.curr_line() as i64;
            let source = debug.source().source.as_deref().map(normalize_path);
            if let Err(e) = debugger.on_line(lua, source.as_deref(), line, &mut state) {
                warn!(error = %e, line, "Debug hook failed");
            }
            Ok(VmState::Continue)
        });

        debug!(?id, "Registered interpreter");
        Ok(id)
    }

    /// Removes `id` only while it still belongs to the hook owning `flags`.
    fn unregister(&self, id: InterpreterId, flags: &Arc<InterpreterFlags>) {
        let mut state = self.state.lock();
        let owned = state
            .interpreters
            .get(id)
            .is_some_and(|slot| Arc::ptr_eq(&slot.flags, flags));
        if !owned {
            return;
        }
        state.interpreters.remove(id);
        debug!(?id, "Unregistered interpreter");
        if state.last_paused == Some(id) {
            state.last_paused = None;
        }
    }

    /// Records the helper code and extension names sent by the IDE. Only the
    /// first call of a session takes effect.
    pub fn start(&self, helper_code: &str, ext_names: Vec<String>) {
        let mut state = self.state.lock();
        if state.started {
            debug!("Debugger already started, ignoring");
            return;
        }
        state.started = true;
        state.helper_code = Some(Arc::from(helper_code));
        state.ext_names = ext_names;
        info!(extensions = ?state.ext_names, "Debugger started");
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Arms the hooks of every registered interpreter.
    pub fn attach_all(&self) {
        let state = self.state.lock();
        if state.stopped {
            return;
        }
        for slot in state.interpreters.values() {
            slot.flags.armed.store(true, Ordering::Release);
        }
    }

    /// Arms a single interpreter. Returns false for an unknown handle.
    pub fn attach(&self, id: InterpreterId) -> bool {
        let state = self.state.lock();
        match state.interpreters.get(id) {
            Some(slot) if !state.stopped => {
                slot.flags.armed.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub fn interpreter_count(&self) -> usize {
        self.state.lock().interpreters.len()
    }

    pub fn is_paused(&self) -> bool {
        self.state
            .lock()
            .interpreters
            .values()
            .any(|slot| slot.flags.paused.load(Ordering::Acquire))
    }

    pub fn add_breakpoint(&self, bp: BreakPoint) {
        debug!(file = %bp.file, line = bp.line, "Add breakpoint");
        self.registry.add(bp);
    }

    pub fn remove_breakpoint(&self, file: &str, line: i64) {
        debug!(file, line, "Remove breakpoint");
        self.registry.remove(file, line);
    }

    pub fn remove_all_breakpoints(&self) {
        debug!("Remove all breakpoints");
        self.registry.clear();
    }

    /// Applies an `AddBreakPointReq`; with `clear` set, the old set is
    /// replaced in one step.
    pub fn apply_add_breakpoints(&self, req: &AddBreakPointReq) {
        let bps = req.break_points.iter().map(BreakPoint::from);
        if req.clear {
            self.registry.replace_all(bps);
        } else {
            self.registry.add_all(bps);
        }
        debug!(clear = req.clear, total = self.registry.len(), "Breakpoints updated");
    }

    pub fn apply_remove_breakpoints(&self, req: &RemoveBreakPointReq) {
        for bp in &req.break_points {
            self.remove_breakpoint(&normalize_path(&bp.file), bp.line);
        }
    }

    pub fn do_action(&self, action: Action) {
        match action {
            Action::Break => {
                let state = self.state.lock();
                for slot in state.interpreters.values() {
                    if slot.flags.armed.load(Ordering::Acquire)
                        && !slot.flags.paused.load(Ordering::Acquire)
                    {
                        slot.flags.break_requested.store(true, Ordering::Release);
                    }
                }
            }
            Action::Stop => {
                {
                    let mut state = self.state.lock();
                    state.stopped = true;
                    for slot in state.interpreters.values() {
                        slot.flags.armed.store(false, Ordering::Release);
                        slot.flags.break_requested.store(false, Ordering::Release);
                    }
                }
                info!("Debugging stopped");
                self.release_all();
            }
            resume => match self.route() {
                Some((id, tx)) => {
                    debug!(?id, action = ?resume, "Resume interpreter");
                    let _ = tx.send(Command::Resume(resume));
                }
                None => debug!(action = ?resume, "No paused interpreter, ignoring action"),
            },
        }
    }

    /// Hands `ctx` to the paused interpreter. The result is reported through
    /// the sink, immediately as a failure when nothing is paused.
    pub fn eval(&self, ctx: EvalContext) {
        let Some((_, tx)) = self.route() else {
            self.emit_eval(ctx.fail(DebuggerError::NotPaused));
            return;
        };
        if let Err(SendError(Command::Eval(ctx))) = tx.send(Command::Eval(ctx)) {
            self.emit_eval(ctx.fail(DebuggerError::NotPaused));
        }
    }

    /// Lets every paused thread run on without disarming anything.
    pub fn release_all(&self) {
        let state = self.state.lock();
        for slot in state.interpreters.values() {
            if slot.flags.paused.load(Ordering::Acquire) {
                let _ = slot.command_tx.send(Command::Release);
            }
        }
    }

    /// Ends the session: disarms every hook, releases paused threads and
    /// forgets interpreters and breakpoints.
    pub fn shutdown(&self) {
        // Draining keeps the map so keys handed out later never equal old ones.
        let interpreters: Vec<InterpreterSlot> = {
            let mut state = self.state.lock();
            state.started = false;
            state.stopped = false;
            state.helper_code = None;
            state.ext_names.clear();
            state.last_paused = None;
            state.interpreters.drain().map(|(_, slot)| slot).collect()
        };
        for slot in interpreters {
            slot.flags.armed.store(false, Ordering::Release);
            slot.flags.break_requested.store(false, Ordering::Release);
            if slot.flags.paused.load(Ordering::Acquire) {
                let _ = slot.command_tx.send(Command::Release);
            }
        }
        self.registry.clear();
    }

    /// The most recently paused interpreter if it is still paused, else any
    /// paused one.
    fn route(&self) -> Option<(InterpreterId, Sender<Command>)> {
        let state = self.state.lock();
        let is_paused = |slot: &InterpreterSlot| slot.flags.paused.load(Ordering::Acquire);

        state
            .last_paused
            .and_then(|id| state.interpreters.get(id).filter(|s| is_paused(s)).map(|s| (id, s)))
            .or_else(|| state.interpreters.iter().find(|(_, s)| is_paused(s)))
            .map(|(id, slot)| (id, slot.command_tx.clone()))
    }

    fn on_line(
        &self,
        lua: &Lua,
        file: Option<&str>,
        line: i64,
        state: &mut HookState,
    ) -> Result<(), DebuggerError> {
        if !state.helper_loaded {
            self.load_helper(lua, state);
        }

        let mut stop = state.flags.break_requested.swap(false, Ordering::AcqRel);
        if !stop && state.policy.is_stepping() {
            stop = state.policy.should_stop(stack::stack_depth(lua));
        }
        if !stop && self.registry.has_line(line) {
            if let Some(bp) = file.and_then(|file| self.find_breakpoint(file, line)) {
                stop = match bp.condition.as_deref() {
                    Some(condition) => eval::evaluate_condition(lua, &state.introspection, condition),
                    None => true,
                };
            }
        }

        if stop {
            self.pause(lua, state)?;
        }
        Ok(())
    }

    /// Exact or suffix match, then the same with each registered extension
    /// appended for chunk names given without one.
    fn find_breakpoint(&self, file: &str, line: i64) -> Option<BreakPoint> {
        self.registry.find(file, line).or_else(|| {
            let ext_names = self.state.lock().ext_names.clone();
            ext_names
                .iter()
                .filter(|ext| !file.ends_with(ext.as_str()))
                .find_map(|ext| self.registry.find(&format!("{}{}", file, ext), line))
        })
    }

    fn load_helper(&self, lua: &Lua, state: &mut HookState) {
        state.helper_loaded = true;
        let helper = self.state.lock().helper_code.clone();
        let Some(code) = helper.filter(|code| !code.trim().is_empty()) else {
            return;
        };
        match lua.load(&*code).set_name("=emmyHelper").exec() {
            Ok(()) => debug!(id = ?state.id, "Loaded helper code"),
            Err(e) => warn!(id = ?state.id, error = %e, "Failed to load helper code"),
        }
    }

    fn get_stacks(&self, lua: &Lua, state: &mut HookState) -> Result<Vec<StackFrame>, DebuggerError> {
        let mut builder = VariableBuilder::new(&mut state.cache, self.max_children);
        stack::capture_stacks(lua, &state.introspection, &mut builder, self.variable_depth)
    }

    fn pause(&self, lua: &Lua, state: &mut HookState) -> Result<(), DebuggerError> {
        // Commands routed to an earlier pause are stale.
        while let Ok(command) = state.commands.try_recv() {
            if let Command::Eval(ctx) = command {
                self.emit_eval(ctx.fail(DebuggerError::NotPaused));
            }
        }

        let frames = self.get_stacks(lua, state)?;
        state.flags.paused.store(true, Ordering::Release);
        self.state.lock().last_paused = Some(state.id);
        debug!(
            id = ?state.id,
            file = frames.first().map(|f| f.file.as_str()).unwrap_or_default(),
            line = frames.first().map(|f| f.line).unwrap_or_default(),
            "Paused"
        );
        if let Some(sink) = self.sink.upgrade() {
            sink.on_break(frames);
        }

        let policy = loop {
            match state.commands.recv() {
                Ok(Command::Eval(ctx)) => {
                    let ctx = eval::evaluate(
                        lua,
                        &state.introspection,
                        &mut state.cache,
                        self.max_children,
                        ctx,
                    );
                    self.emit_eval(ctx);
                }
                Ok(Command::Resume(action)) => {
                    break StepPolicy::from_action(action, stack::stack_depth(lua));
                }
                Ok(Command::Release) | Err(_) => break StepPolicy::Run,
            }
        };

        state.policy = policy;
        state.cache.clear();
        state.flags.paused.store(false, Ordering::Release);
        debug!(id = ?state.id, ?policy, "Resumed");
        Ok(())
    }

    fn emit_eval(&self, ctx: EvalContext) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_eval_result(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    const SCRIPT: &str = "local function add(a, b)
  return a + b
end
local x = 1
local y = add(x, 2)
local z = y * 2
";

    struct RecordingSink {
        breaks: Sender<Vec<StackFrame>>,
        evals: Sender<EvalContext>,
    }

    impl DebugEventSink for RecordingSink {
        fn on_break(&self, frames: Vec<StackFrame>) {
            let _ = self.breaks.send(frames);
        }

        fn on_eval_result(&self, ctx: EvalContext) {
            let _ = self.evals.send(ctx);
        }
    }

    struct Harness {
        debugger: Arc<Debugger>,
        breaks: Receiver<Vec<StackFrame>>,
        evals: Receiver<EvalContext>,
        _sink: Arc<dyn DebugEventSink>,
    }

    fn harness() -> Harness {
        let (breaks_tx, breaks) = crossbeam_channel::unbounded();
        let (evals_tx, evals) = crossbeam_channel::unbounded();
        let sink: Arc<dyn DebugEventSink> = Arc::new(RecordingSink {
            breaks: breaks_tx,
            evals: evals_tx,
        });
        let debugger = Arc::new(Debugger::new(&DebuggerConfig::default(), Arc::downgrade(&sink)));
        debugger.start("", vec![".lua".to_string()]);
        Harness {
            debugger,
            breaks,
            evals,
            _sink: sink,
        }
    }

    fn run_script(debugger: &Arc<Debugger>, name: &str, code: &str) -> JoinHandle<Result<(), String>> {
        let debugger = Arc::clone(debugger);
        let name = name.to_string();
        let code = code.to_string();
        thread::spawn(move || {
            let lua = unsafe { Lua::unsafe_new() };
            debugger.register(&lua).map_err(|e| e.to_string())?;
            lua.load(code).set_name(name).exec().map_err(|e| e.to_string())
        })
    }

    #[test]
    fn test_breakpoint_pauses_and_continue_resumes() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 5));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].file, "x.lua");
        assert_eq!(frames[0].line, 5);
        assert!(h.debugger.is_paused());

        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
        assert!(h.breaks.try_recv().is_err());
        assert!(!h.debugger.is_paused());
    }

    #[test]
    fn test_breakpoint_matches_path_suffix() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("/home/dev/project/scripts/x.lua", 4));
        let handle = run_script(&h.debugger, "@scripts/x.lua", SCRIPT);

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].line, 4);
        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_breakpoint_matches_with_extension() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("mod.lua", 4));
        let handle = run_script(&h.debugger, "@mod", SCRIPT);

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].file, "mod");
        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_step_over_does_not_enter_call() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 5));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);

        h.breaks.recv_timeout(TIMEOUT).unwrap();
        h.debugger.remove_all_breakpoints();
        h.debugger.do_action(Action::StepOver);

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].line, 6);
        assert_eq!(frames.len(), 1);
        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_step_into_and_out() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 5));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);

        h.breaks.recv_timeout(TIMEOUT).unwrap();
        h.debugger.remove_all_breakpoints();
        h.debugger.do_action(Action::StepInto);

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].line, 2);
        assert_eq!(frames[0].function_name, "add");
        assert_eq!(frames.len(), 2);

        h.debugger.do_action(Action::StepOut);
        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames.len(), 1);
        assert_ne!(frames[0].line, 2);

        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_locals_are_captured() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 6));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        let locals: Vec<(&str, &str)> = frames[0]
            .local_variables
            .iter()
            .filter(|v| v.name != "add")
            .map(|v| (v.name.as_str(), v.value.as_str()))
            .collect();
        assert_eq!(locals, vec![("x", "1"), ("y", "3")]);

        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_eval_in_paused_frame() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 6));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);
        h.breaks.recv_timeout(TIMEOUT).unwrap();

        h.debugger.eval(EvalContext {
            expr: "x + y".to_string(),
            seq: 5,
            depth: 1,
            ..Default::default()
        });
        let ctx = h.evals.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(ctx.seq, 5);
        assert!(ctx.success);
        assert_eq!(ctx.result.unwrap().value, "4");

        h.debugger.eval(EvalContext {
            expr: "x +".to_string(),
            seq: 6,
            ..Default::default()
        });
        let ctx = h.evals.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(ctx.seq, 6);
        assert!(!ctx.success);
        assert!(ctx.error.is_some());

        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_eval_when_not_paused() {
        let h = harness();
        h.debugger.eval(EvalContext {
            expr: "1".to_string(),
            seq: 1,
            ..Default::default()
        });
        let ctx = h.evals.recv_timeout(TIMEOUT).unwrap();
        assert!(!ctx.success);
        assert_eq!(ctx.error.as_deref(), Some("debugger is not paused"));
    }

    #[test]
    fn test_conditional_breakpoint() {
        let h = harness();
        h.debugger
            .add_breakpoint(BreakPoint::new("x.lua", 6).with_condition("y == 4"));
        run_script(&h.debugger, "@x.lua", SCRIPT).join().unwrap().unwrap();
        assert!(h.breaks.try_recv().is_err());

        h.debugger
            .add_breakpoint(BreakPoint::new("x.lua", 6).with_condition("nil + 1"));
        run_script(&h.debugger, "@x.lua", SCRIPT).join().unwrap().unwrap();
        assert!(h.breaks.try_recv().is_err());

        h.debugger
            .add_breakpoint(BreakPoint::new("x.lua", 6).with_condition("y == 3"));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);
        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].line, 6);
        h.debugger.do_action(Action::Continue);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_hooks_inert_until_started() {
        let (breaks_tx, breaks) = crossbeam_channel::unbounded();
        let (evals_tx, _evals) = crossbeam_channel::unbounded();
        let sink: Arc<dyn DebugEventSink> = Arc::new(RecordingSink {
            breaks: breaks_tx,
            evals: evals_tx,
        });
        let debugger = Arc::new(Debugger::new(&DebuggerConfig::default(), Arc::downgrade(&sink)));
        debugger.add_breakpoint(BreakPoint::new("x.lua", 4));

        run_script(&debugger, "@x.lua", SCRIPT).join().unwrap().unwrap();
        assert!(breaks.try_recv().is_err());
        assert!(!debugger.is_started());
    }

    #[test]
    fn test_attach_arms_single_interpreter() {
        let (breaks_tx, breaks) = crossbeam_channel::unbounded();
        let (evals_tx, _evals) = crossbeam_channel::unbounded();
        let sink: Arc<dyn DebugEventSink> = Arc::new(RecordingSink {
            breaks: breaks_tx,
            evals: evals_tx,
        });
        let debugger = Arc::new(Debugger::new(&DebuggerConfig::default(), Arc::downgrade(&sink)));
        debugger.add_breakpoint(BreakPoint::new("x.lua", 4));

        let (id_tx, id_rx) = crossbeam_channel::bounded(0);
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || {
                let lua = unsafe { Lua::unsafe_new() };
                id_tx.send(debugger.register(&lua).unwrap()).unwrap();
                go_rx.recv().unwrap();
                lua.load(SCRIPT).set_name("@x.lua").exec().unwrap();
            })
        };

        let id = id_rx.recv_timeout(TIMEOUT).unwrap();
        assert!(debugger.attach(id));
        go_tx.send(()).unwrap();

        let frames = breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].line, 4);
        debugger.do_action(Action::Continue);
        handle.join().unwrap();
        assert!(!debugger.attach(id));
    }

    #[test]
    fn test_break_action_pauses_next_line() {
        let h = harness();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
        let debugger = Arc::clone(&h.debugger);
        let handle = thread::spawn(move || {
            let lua = unsafe { Lua::unsafe_new() };
            debugger.register(&lua).unwrap();
            ready_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            lua.load(SCRIPT).set_name("@x.lua").exec().unwrap();
        });

        ready_rx.recv_timeout(TIMEOUT).unwrap();
        h.debugger.do_action(Action::Break);
        go_tx.send(()).unwrap();

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].line, 1);
        h.debugger.do_action(Action::Continue);
        handle.join().unwrap();
        assert!(h.breaks.try_recv().is_err());
    }

    #[test]
    fn test_reregister_after_shutdown_keeps_new_slot() {
        let h = harness();
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let debugger = Arc::clone(&h.debugger);
        let handle = thread::spawn(move || {
            let lua = unsafe { Lua::unsafe_new() };
            debugger.register(&lua).unwrap();
            done_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            debugger.register(&lua).unwrap();
            done_tx.send(()).unwrap();
            go_rx.recv().unwrap();
            lua.load(SCRIPT).set_name("@x.lua").exec().unwrap();
        });

        done_rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(h.debugger.interpreter_count(), 1);
        h.debugger.shutdown();
        assert_eq!(h.debugger.interpreter_count(), 0);
        assert!(!h.debugger.is_started());

        go_tx.send(()).unwrap();
        done_rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(h.debugger.interpreter_count(), 1);

        h.debugger.start("", vec![".lua".to_string()]);
        h.debugger.attach_all();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 4));
        go_tx.send(()).unwrap();

        let frames = h.breaks.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(frames[0].line, 4);
        h.debugger.do_action(Action::Continue);
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_releases_and_disarms() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 4));
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 6));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);

        h.breaks.recv_timeout(TIMEOUT).unwrap();
        h.debugger.do_action(Action::Stop);
        handle.join().unwrap().unwrap();
        assert!(h.breaks.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_releases_paused_thread() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("x.lua", 4));
        let handle = run_script(&h.debugger, "@x.lua", SCRIPT);

        h.breaks.recv_timeout(TIMEOUT).unwrap();
        h.debugger.shutdown();
        handle.join().unwrap().unwrap();
        assert!(h.debugger.registry().is_empty());
        assert!(!h.debugger.is_started());
    }

    #[test]
    fn test_dropped_interpreter_is_unregistered() {
        let h = harness();
        run_script(&h.debugger, "@x.lua", "local a = 1").join().unwrap().unwrap();
        assert_eq!(h.debugger.interpreter_count(), 0);
    }

    #[test]
    fn test_resume_without_pause_is_ignored() {
        let h = harness();
        h.debugger.do_action(Action::Continue);
        h.debugger.do_action(Action::StepOver);
        assert!(!h.debugger.is_paused());
    }

    #[test]
    fn test_apply_add_breakpoints_with_clear() {
        let h = harness();
        h.debugger.add_breakpoint(BreakPoint::new("old.lua", 1));
        h.debugger.apply_add_breakpoints(&AddBreakPointReq {
            clear: true,
            break_points: vec![crate::protocol::BreakPointProto {
                file: "@./new.lua".to_string(),
                line: 3,
                ..Default::default()
            }],
        });
        let list = h.debugger.registry().list();
        assert_eq!(list, vec![BreakPoint::new("new.lua", 3)]);

        h.debugger.apply_remove_breakpoints(&RemoveBreakPointReq {
            break_points: vec![crate::protocol::BreakPointProto {
                file: "new.lua".to_string(),
                line: 3,
                ..Default::default()
            }],
        });
        assert!(h.debugger.registry().is_empty());
    }
}
