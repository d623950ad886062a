use std::cmp::Ordering;
use std::collections::HashMap;

use mlua::Value;

use crate::protocol::Variable;

/// Lua type tags as the IDE expects them.
pub mod lua_type {
    pub const NIL: i32 = 0;
    pub const BOOLEAN: i32 = 1;
    pub const LIGHT_USERDATA: i32 = 2;
    pub const NUMBER: i32 = 3;
    pub const STRING: i32 = 4;
    pub const TABLE: i32 = 5;
    pub const FUNCTION: i32 = 6;
    pub const USERDATA: i32 = 7;
    pub const THREAD: i32 = 8;
}

pub fn type_tag(value: &Value) -> i32 {
    match value {
        Value::Nil => lua_type::NIL,
        Value::Boolean(_) => lua_type::BOOLEAN,
        Value::LightUserData(_) => lua_type::LIGHT_USERDATA,
        Value::Integer(_) | Value::Number(_) => lua_type::NUMBER,
        Value::String(_) => lua_type::STRING,
        Value::Table(_) => lua_type::TABLE,
        Value::Function(_) => lua_type::FUNCTION,
        Value::Thread(_) => lua_type::THREAD,
        _ => lua_type::USERDATA,
    }
}

/// Renders a value the way `tostring` would, without running metamethods.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => {
            if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e16 {
                format!("{:.1}", n)
            } else {
                n.to_string()
            }
        }
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Error(e) => e.to_string(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

/// Composite values summarized in a pause, addressable by `cacheId`.
///
/// Lives on the interpreter thread and is cleared on every resume.
#[derive(Debug, Default)]
pub struct VariableCache {
    next_id: i64,
    values: HashMap<i64, Value>,
}

impl VariableCache {
    pub fn insert(&mut self, value: Value) -> i64 {
        self.next_id += 1;
        self.values.insert(self.next_id, value);
        self.next_id
    }

    pub fn get(&self, id: i64) -> Option<Value> {
        self.values.get(&id).cloned()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Serializes Lua values into wire variables, expanding tables up to a depth.
pub struct VariableBuilder<'a> {
    cache: &'a mut VariableCache,
    max_children: usize,
}

impl<'a> VariableBuilder<'a> {
    pub fn new(cache: &'a mut VariableCache, max_children: usize) -> Self {
        Self {
            cache,
            max_children,
        }
    }

    pub fn named(&mut self, name: impl Into<String>, value: &Value, depth: usize) -> Variable {
        self.build(name.into(), lua_type::STRING, value, depth)
    }

    fn build(&mut self, name: String, name_type: i32, value: &Value, depth: usize) -> Variable {
        let mut variable = Variable {
            name,
            name_type,
            value: display_value(value),
            value_type: type_tag(value),
            value_type_name: value.type_name().to_string(),
            cache_id: 0,
            children: None,
        };

        if let Value::Table(table) = value {
            if depth == 0 {
                variable.cache_id = self.cache.insert(value.clone());
            } else {
                let mut entries: Vec<(Value, Value)> = table
                    .clone()
                    .pairs::<Value, Value>()
                    .filter_map(Result::ok)
                    .collect();
                entries.sort_by(|(a, _), (b, _)| compare_keys(a, b));
                entries.truncate(self.max_children);

                let children = entries
                    .iter()
                    .map(|(key, child)| self.build(display_value(key), type_tag(key), child, depth - 1))
                    .collect();
                variable.children = Some(children);
            }
        }
        variable
    }
}

/// Numeric keys first in numeric order, then everything else by display text.
fn compare_keys(a: &Value, b: &Value) -> Ordering {
    fn as_number(value: &Value) -> Option<f64> {
        match value {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => display_value(a).cmp(&display_value(b)),
    }
}

#[cfg(test)]
mod tests {
    use mlua::Lua;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("return nil", "nil", lua_type::NIL)]
    #[case("return true", "true", lua_type::BOOLEAN)]
    #[case("return 1 + 1", "2", lua_type::NUMBER)]
    #[case("return 2.5", "2.5", lua_type::NUMBER)]
    #[case("return 4 / 2", "2.0", lua_type::NUMBER)]
    #[case("return 'hi'", "hi", lua_type::STRING)]
    fn test_scalar_variables(#[case] code: &str, #[case] display: &str, #[case] tag: i32) {
        let lua = Lua::new();
        let value: Value = lua.load(code).eval().unwrap();
        let mut cache = VariableCache::default();
        let variable = VariableBuilder::new(&mut cache, 10).named("v", &value, 1);
        assert_eq!(variable.value, display);
        assert_eq!(variable.value_type, tag);
        assert_eq!(variable.cache_id, 0);
        assert!(variable.children.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_table_expanded_in_key_order() {
        let lua = Lua::new();
        let value: Value = lua.load("return { 'a', 'b', name = 'x', [10] = true }").eval().unwrap();
        let mut cache = VariableCache::default();
        let variable = VariableBuilder::new(&mut cache, 10).named("t", &value, 1);

        assert_eq!(variable.value_type, lua_type::TABLE);
        let children = variable.children.unwrap();
        let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["1", "2", "10", "name"]);
        assert_eq!(children[0].name_type, lua_type::NUMBER);
        assert_eq!(children[3].name_type, lua_type::STRING);
        assert_eq!(children[3].value, "x");
    }

    #[test]
    fn test_table_at_depth_zero_is_cached() {
        let lua = Lua::new();
        let value: Value = lua.load("return { inner = { 1, 2, 3 } }").eval().unwrap();
        let mut cache = VariableCache::default();
        let variable = VariableBuilder::new(&mut cache, 10).named("t", &value, 1);

        let children = variable.children.unwrap();
        let inner = &children[0];
        assert!(inner.children.is_none());
        assert!(inner.cache_id > 0);
        assert_eq!(cache.len(), 1);

        let cached = cache.get(inner.cache_id).unwrap();
        let expanded = VariableBuilder::new(&mut cache, 10).named("inner", &cached, 1);
        assert_eq!(expanded.children.unwrap().len(), 3);
    }

    #[test]
    fn test_children_are_capped() {
        let lua = Lua::new();
        let value: Value = lua
            .load("local t = {} for i = 1, 50 do t[i] = i end return t")
            .eval()
            .unwrap();
        let mut cache = VariableCache::default();
        let variable = VariableBuilder::new(&mut cache, 5).named("t", &value, 1);
        assert_eq!(variable.children.unwrap().len(), 5);
    }

    #[test]
    fn test_cache_clear() {
        let mut cache = VariableCache::default();
        let first = cache.insert(Value::Nil);
        let second = cache.insert(Value::Boolean(true));
        assert_ne!(first, second);
        cache.clear();
        assert!(cache.get(first).is_none());
        assert!(cache.is_empty());
    }
}
