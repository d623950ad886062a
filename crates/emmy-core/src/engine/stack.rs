use mlua::{Function, Lua, Table, Value};

use crate::breakpoint::normalize_path;
use crate::error::DebuggerError;
use crate::protocol::StackFrame;

use super::variable::VariableBuilder;

/// `debug.getlocal` called from Rust adds its own frame at level 0, so a
/// stack level seen by `inspect_stack` is one deeper for the debug library.
const DEBUG_LIBRARY_LEVEL_OFFSET: usize = 1;

/// Functions from the `debug` library, captured at registration so a later
/// sandbox cannot take them away.
#[derive(Debug, Clone)]
pub struct Introspection {
    getlocal: Function,
    getupvalue: Function,
    getinfo: Function,
}

impl Introspection {
    pub fn capture(lua: &Lua) -> Result<Self, DebuggerError> {
        let debug_table: Option<Table> = lua.globals().get("debug")?;
        let debug_table = debug_table.ok_or(DebuggerError::MissingDebugLibrary)?;
        let lookup = |name: &str| -> Result<Function, DebuggerError> {
            let function: Option<Function> = debug_table.get(name)?;
            function.ok_or(DebuggerError::MissingDebugLibrary)
        };
        Ok(Self {
            getlocal: lookup("getlocal")?,
            getupvalue: lookup("getupvalue")?,
            getinfo: lookup("getinfo")?,
        })
    }

    /// Named locals of the frame at `level`, innermost first order preserved.
    ///
    /// Compiler temporaries such as `(for state)` are skipped.
    pub fn locals(&self, level: usize) -> Result<Vec<(String, Value)>, DebuggerError> {
        let level = level + DEBUG_LIBRARY_LEVEL_OFFSET;
        let mut locals = Vec::new();
        for index in 1.. {
            let (name, value) = self
                .getlocal
                .call::<(Option<String>, Value)>((level, index))?;
            match name {
                Some(name) if name.starts_with('(') => continue,
                Some(name) => locals.push((name, value)),
                None => break,
            }
        }
        Ok(locals)
    }

    pub fn upvalues(&self, level: usize) -> Result<Vec<(String, Value)>, DebuggerError> {
        let info: Option<Table> = self
            .getinfo
            .call((level + DEBUG_LIBRARY_LEVEL_OFFSET, "f"))?;
        let Some(function) = info.map(|info| info.get::<Value>("func")).transpose()? else {
            return Ok(Vec::new());
        };
        let Value::Function(function) = function else {
            return Ok(Vec::new());
        };

        let mut upvalues = Vec::new();
        for index in 1.. {
            let (name, value) = self
                .getupvalue
                .call::<(Option<String>, Value)>((function.clone(), index))?;
            match name {
                Some(name) if name.is_empty() || name == "_ENV" => continue,
                Some(name) => upvalues.push((name, value)),
                None => break,
            }
        }
        Ok(upvalues)
    }

    /// Table usable as a chunk environment that resolves names the way code
    /// in the frame at `level` would: locals, then upvalues, then globals.
    pub fn frame_environment(&self, lua: &Lua, level: usize) -> Result<Table, DebuggerError> {
        let env = lua.create_table()?;
        for (name, value) in self.upvalues(level)? {
            env.raw_set(name, value)?;
        }
        for (name, value) in self.locals(level)? {
            env.raw_set(name, value)?;
        }
        let meta = lua.create_table()?;
        meta.raw_set("__index", lua.globals())?;
        let setmetatable: Function = lua.globals().get("setmetatable")?;
        setmetatable.call::<()>((env.clone(), meta))?;
        Ok(env)
    }
}

/// Number of active frames at the moment of the call.
pub fn stack_depth(lua: &Lua) -> usize {
    let mut depth = 0;
    while lua.inspect_stack(depth).is_some() {
        depth += 1;
    }
    depth
}

/// Walks the call stack from the innermost frame outwards.
pub fn capture_stacks(
    lua: &Lua,
    introspection: &Introspection,
    builder: &mut VariableBuilder<'_>,
    depth: usize,
) -> Result<Vec<StackFrame>, DebuggerError> {
    let mut frames = Vec::new();
    let mut level = 0;
    while let Some(debug) = lua.inspect_stack(level) {
        let source = debug.source();
        let file = source
            .source
            .as_deref()
            .map(normalize_path)
            .unwrap_or_default();
        let is_c_function = source.what == "C";
        let function_name = debug
            .names()
            .name
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| if source.what == "main" { "main".to_string() } else { "?".to_string() });
        let line = debug.curr_line() as i64;

        let (local_variables, upvalue_variables) = if is_c_function {
            (Vec::new(), Vec::new())
        } else {
            let locals = introspection
                .locals(level)?
                .iter()
                .map(|(name, value)| builder.named(name.as_str(), value, depth))
                .collect();
            let upvalues = introspection
                .upvalues(level)?
                .iter()
                .map(|(name, value)| builder.named(name.as_str(), value, depth))
                .collect();
            (locals, upvalues)
        };

        frames.push(StackFrame {
            level,
            file,
            function_name,
            line,
            local_variables,
            upvalue_variables,
        });
        level += 1;
    }
    Ok(frames)
}
