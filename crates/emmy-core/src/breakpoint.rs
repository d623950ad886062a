use std::collections::HashMap;

use parking_lot::Mutex;

use crate::protocol::BreakPointProto;

/// A breakpoint identified by its `(file, line)` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakPoint {
    pub file: String,
    pub line: i64,
    pub condition: Option<String>,
}

impl BreakPoint {
    pub fn new(file: impl AsRef<str>, line: i64) -> Self {
        Self {
            file: normalize_path(file.as_ref()),
            line,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        let condition = condition.into();
        self.condition = if condition.trim().is_empty() {
            None
        } else {
            Some(condition)
        };
        self
    }

    pub fn key(&self) -> (&str, i64) {
        (&self.file, self.line)
    }
}

impl From<&BreakPointProto> for BreakPoint {
    fn from(proto: &BreakPointProto) -> Self {
        let bp = BreakPoint::new(&proto.file, proto.line);
        match &proto.condition {
            Some(condition) => bp.with_condition(condition),
            None => bp,
        }
    }
}

/// Strips chunk-name decorations so IDE paths and Lua sources compare equal.
pub fn normalize_path(path: &str) -> String {
    let path = path.strip_prefix('@').unwrap_or(path);
    let mut normalized = path.replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized
}

/// True when one path equals the other or ends with it on a `/` boundary.
fn paths_match(a: &str, b: &str) -> bool {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    if long == short {
        return true;
    }
    long.ends_with(short) && long.as_bytes()[long.len() - short.len() - 1] == b'/'
}

#[derive(Debug, Default)]
struct Breakpoints {
    by_file: HashMap<String, HashMap<i64, BreakPoint>>,
    /// Number of breakpoints per line, across every file.
    lines: HashMap<i64, usize>,
}

impl Breakpoints {
    fn insert(&mut self, bp: BreakPoint) {
        let line = bp.line;
        let previous = self
            .by_file
            .entry(bp.file.clone())
            .or_default()
            .insert(line, bp);
        if previous.is_none() {
            *self.lines.entry(line).or_default() += 1;
        }
    }

    fn remove(&mut self, file: &str, line: i64) -> Option<BreakPoint> {
        let lines = self.by_file.get_mut(file)?;
        let removed = lines.remove(&line)?;
        if lines.is_empty() {
            self.by_file.remove(file);
        }
        if let Some(count) = self.lines.get_mut(&line) {
            *count -= 1;
            if *count == 0 {
                self.lines.remove(&line);
            }
        }
        Some(removed)
    }

    fn clear(&mut self) {
        self.by_file.clear();
        self.lines.clear();
    }

    fn find(&self, file: &str, line: i64) -> Option<&BreakPoint> {
        if !self.lines.contains_key(&line) {
            return None;
        }
        if let Some(bp) = self.by_file.get(file).and_then(|lines| lines.get(&line)) {
            return Some(bp);
        }
        self.by_file
            .iter()
            .filter(|(bp_file, _)| paths_match(bp_file, file))
            .find_map(|(_, lines)| lines.get(&line))
    }
}

/// Thread-safe map from `(file, line)` to breakpoint.
///
/// Every operation takes the same lock, so a hook thread never observes a
/// partially applied batch edit.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    inner: Mutex<Breakpoints>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a breakpoint, replacing the condition of an existing key.
    pub fn add(&self, bp: BreakPoint) {
        self.inner.lock().insert(bp);
    }

    pub fn add_all(&self, bps: impl IntoIterator<Item = BreakPoint>) {
        let mut inner = self.inner.lock();
        for bp in bps {
            inner.insert(bp);
        }
    }

    /// Clears the registry and installs `bps` under a single lock.
    pub fn replace_all(&self, bps: impl IntoIterator<Item = BreakPoint>) {
        let mut inner = self.inner.lock();
        inner.clear();
        for bp in bps {
            inner.insert(bp);
        }
    }

    pub fn remove(&self, file: &str, line: i64) -> Option<BreakPoint> {
        self.inner.lock().remove(&normalize_path(file), line)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Cheap pre-check for the line hook: no path work when nothing is set on `line`.
    #[inline(always)]
    pub fn has_line(&self, line: i64) -> bool {
        self.inner.lock().lines.contains_key(&line)
    }

    /// Looks up a breakpoint for an already normalized file name.
    pub fn find(&self, file: &str, line: i64) -> Option<BreakPoint> {
        self.inner.lock().find(file, line).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_file.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_file.is_empty()
    }

    /// All breakpoints ordered by `(file, line)`.
    pub fn list(&self) -> Vec<BreakPoint> {
        let inner = self.inner.lock();
        let mut bps: Vec<BreakPoint> = inner
            .by_file
            .values()
            .flat_map(|lines| lines.values().cloned())
            .collect();
        bps.sort_by(|a, b| a.key().cmp(&b.key()));
        bps
    }
}
