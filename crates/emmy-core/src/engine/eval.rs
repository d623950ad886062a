use mlua::{Lua, Value};
use tracing::warn;

use crate::error::DebuggerError;
use crate::protocol::{EvalReq, EvalRsp, Variable};

use super::stack::Introspection;
use super::variable::{VariableBuilder, VariableCache};

/// One evaluation request and, once run, its outcome.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvalContext {
    pub expr: String,
    pub seq: i64,
    pub stack_level: usize,
    pub depth: usize,
    pub cache_id: i64,
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<Variable>,
}

impl EvalContext {
    pub fn fail(mut self, error: impl ToString) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self.result = None;
        self
    }

    pub fn into_response(self) -> EvalRsp {
        EvalRsp {
            seq: self.seq,
            success: self.success,
            error: self.error,
            value: if self.success { self.result } else { None },
        }
    }
}

impl From<EvalReq> for EvalContext {
    fn from(req: EvalReq) -> Self {
        Self {
            expr: req.expr,
            seq: req.seq,
            stack_level: req.stack_level,
            depth: req.depth,
            cache_id: req.cache_id,
            ..Default::default()
        }
    }
}

/// Runs `ctx` against the paused interpreter. Errors end up in the context,
/// never in the script.
pub fn evaluate(
    lua: &Lua,
    introspection: &Introspection,
    cache: &mut VariableCache,
    max_children: usize,
    mut ctx: EvalContext,
) -> EvalContext {
    match evaluate_inner(lua, introspection, cache, max_children, &ctx) {
        Ok(variable) => {
            ctx.success = true;
            ctx.error = None;
            ctx.result = Some(variable);
            ctx
        }
        Err(e) => ctx.fail(e),
    }
}

fn evaluate_inner(
    lua: &Lua,
    introspection: &Introspection,
    cache: &mut VariableCache,
    max_children: usize,
    ctx: &EvalContext,
) -> Result<Variable, DebuggerError> {
    if ctx.cache_id > 0 {
        let value = cache
            .get(ctx.cache_id)
            .ok_or_else(|| DebuggerError::Eval(format!("no cached value with id {}", ctx.cache_id)))?;
        return Ok(VariableBuilder::new(cache, max_children).named(
            ctx.expr.as_str(),
            &value,
            ctx.depth.max(1),
        ));
    }

    let value = eval_in_frame(lua, introspection, ctx.stack_level, &ctx.expr)?;
    Ok(VariableBuilder::new(cache, max_children).named(ctx.expr.as_str(), &value, ctx.depth))
}

fn eval_in_frame(
    lua: &Lua,
    introspection: &Introspection,
    level: usize,
    expr: &str,
) -> Result<Value, DebuggerError> {
    if expr.trim().is_empty() {
        return Err(DebuggerError::Eval("empty expression".to_string()));
    }
    let env = introspection.frame_environment(lua, level)?;
    let value = lua
        .load(format!("return {}", expr))
        .set_name("=eval")
        .set_environment(env)
        .eval::<Value>()?;
    Ok(value)
}

/// Evaluates a breakpoint condition in the innermost frame. Anything other
/// than a truthy result, including an error, means the breakpoint does not fire.
pub fn evaluate_condition(lua: &Lua, introspection: &Introspection, condition: &str) -> bool {
    match eval_in_frame(lua, introspection, 0, condition) {
        Ok(Value::Nil) | Ok(Value::Boolean(false)) => false,
        Ok(_) => true,
        Err(e) => {
            warn!(condition, error = %e, "Breakpoint condition failed");
            false
        }
    }
}
