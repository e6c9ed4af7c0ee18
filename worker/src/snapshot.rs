//! Converts live Lua values into bounded, cycle-safe [`SerializedValue`]s.
use std::{
    collections::{BTreeMap, HashSet},
    ffi::c_void,
};

use mlua::{Function, Lua, Table, Value};
use transport::{SerializedValue, WorkerOptions};

/// Identities of the tables on the current recursion branch.
type Visited = HashSet<*const c_void>;

pub struct Snapshotter {
    tostring: Function,
    getmetatable: Function,
    max_depth: usize,
    max_repr_len: usize,
}

impl Snapshotter {
    /// Must run before the debuggee gets a chance to replace `tostring`.
    pub fn new(lua: &Lua, options: &WorkerOptions) -> mlua::Result<Self> {
        let globals = lua.globals();
        let debug: Table = globals.get("debug")?;
        Ok(Self {
            tostring: globals.get("tostring")?,
            getmetatable: debug.get("getmetatable")?,
            max_depth: options.max_depth,
            max_repr_len: options.max_repr_len,
        })
    }

    /// Short printable form of `value`. Never fails.
    pub fn safe_repr(&self, value: &Value) -> String {
        match self.repr(value, 0) {
            Ok(text) => truncate(text, self.max_repr_len),
            Err(e) => format!("<error: {}>", crate::inspect::error_message(&e)),
        }
    }

    /// Serialize a named scope. Each top level call gets its own cycle
    /// guard.
    pub fn safe_vars(
        &self,
        entries: impl IntoIterator<Item = (String, Value)>,
        depth: usize,
    ) -> BTreeMap<String, SerializedValue> {
        let mut visited = Visited::new();
        entries
            .into_iter()
            .map(|(name, value)| {
                let value = self.serialize(&value, depth, &mut visited);
                (name, value)
            })
            .collect()
    }

    fn serialize(&self, value: &Value, depth: usize, visited: &mut Visited) -> SerializedValue {
        if depth > self.max_depth {
            return SerializedValue::max_depth();
        }
        match value {
            Value::Nil => SerializedValue::Null,
            Value::Boolean(b) => SerializedValue::Bool(*b),
            Value::Integer(i) => SerializedValue::Integer(*i),
            Value::Number(n) if n.is_finite() => SerializedValue::Number(*n),
            Value::String(s) => SerializedValue::Text(String::from(s.to_string_lossy())),
            Value::Table(table) => self.serialize_table(table, depth, visited),
            other => SerializedValue::Text(self.safe_repr(other)),
        }
    }

    fn serialize_table(
        &self,
        table: &Table,
        depth: usize,
        visited: &mut Visited,
    ) -> SerializedValue {
        let id = table.to_pointer();
        if visited.contains(&id) {
            return SerializedValue::cycle();
        }

        let contents = match TableContents::read(table) {
            Ok(contents) => contents,
            Err(e) => return SerializedValue::error(crate::inspect::error_message(&e)),
        };
        if depth >= self.max_depth {
            return SerializedValue::Text(contents.summary());
        }

        visited.insert(id);
        let out = match contents {
            TableContents::Sequence(items) => SerializedValue::Sequence(
                items
                    .iter()
                    .map(|item| self.serialize(item, depth + 1, visited))
                    .collect(),
            ),
            TableContents::Mapping(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in &entries {
                    let key = self.key_text(key);
                    let value = self.serialize(value, depth + 1, visited);
                    out.entry(key).or_insert(value);
                }
                SerializedValue::Mapping(out)
            }
        };
        visited.remove(&id);
        out
    }

    /// Mapping key as shown to the user. Non-string keys are bracketed so
    /// that `t[1]` and `t["1"]` stay distinct entries.
    fn key_text(&self, key: &Value) -> String {
        match key {
            Value::String(s) => String::from(s.to_string_lossy()),
            other => format!("[{}]", self.safe_repr(other)),
        }
    }

    fn repr(&self, value: &Value, nesting: usize) -> mlua::Result<String> {
        match value {
            Value::Nil => Ok("nil".to_string()),
            Value::Boolean(b) => Ok(b.to_string()),
            Value::Integer(i) => Ok(i.to_string()),
            Value::String(s) => Ok(format!("{:?}", String::from(s.to_string_lossy()))),
            Value::Table(table) if !self.has_tostring(table)? => self.table_repr(table, nesting),
            other => self.tostring(other),
        }
    }

    fn table_repr(&self, table: &Table, nesting: usize) -> mlua::Result<String> {
        if nesting > 0 {
            return Ok("{...}".to_string());
        }
        let mut parts = Vec::new();
        let mut len = 0;
        match TableContents::read(table)? {
            TableContents::Sequence(items) => {
                for item in &items {
                    let part = self.repr(item, nesting + 1)?;
                    len += part.len() + 2;
                    parts.push(part);
                    if len > self.max_repr_len {
                        break;
                    }
                }
            }
            TableContents::Mapping(mut entries) => {
                entries.sort_by_cached_key(|(key, _)| self.key_text(key));
                for (key, value) in &entries {
                    let key = match key {
                        Value::String(s) if is_identifier(&s.to_string_lossy()) => {
                            String::from(s.to_string_lossy())
                        }
                        other => format!("[{}]", self.repr(other, nesting + 1)?),
                    };
                    let part = format!("{key} = {}", self.repr(value, nesting + 1)?);
                    len += part.len() + 2;
                    parts.push(part);
                    if len > self.max_repr_len {
                        break;
                    }
                }
            }
        }
        Ok(format!("{{{}}}", parts.join(", ")))
    }

    fn has_tostring(&self, table: &Table) -> mlua::Result<bool> {
        let metatable: Option<Table> = self.getmetatable.call(table.clone())?;
        match metatable {
            Some(mt) => {
                let handler: Value = mt.raw_get("__tostring")?;
                Ok(!handler.is_nil())
            }
            None => Ok(false),
        }
    }

    fn tostring(&self, value: &Value) -> mlua::Result<String> {
        let text: mlua::String = self.tostring.call(value.clone())?;
        Ok(String::from(text.to_string_lossy()))
    }

    /// `tostring` applied to several values, joined the way a REPL echoes
    /// multiple results.
    pub fn repr_all<'a>(&self, values: impl IntoIterator<Item = &'a Value>) -> String {
        let parts: Vec<String> = values.into_iter().map(|v| self.safe_repr(v)).collect();
        if parts.is_empty() {
            "nil".to_string()
        } else {
            parts.join(", ")
        }
    }
}

enum TableContents {
    /// Keys are exactly `1..=n`.
    Sequence(Vec<Value>),
    Mapping(Vec<(Value, Value)>),
}

impl TableContents {
    fn read(table: &Table) -> mlua::Result<Self> {
        let mut entries = Vec::new();
        table.for_each(|key: Value, value: Value| {
            entries.push((key, value));
            Ok(())
        })?;

        let n = entries.len();
        let is_sequence = entries
            .iter()
            .all(|(key, _)| matches!(key, Value::Integer(i) if *i >= 1 && (*i as usize) <= n));
        if !is_sequence {
            return Ok(TableContents::Mapping(entries));
        }

        let mut items = vec![Value::Nil; n];
        for (key, value) in entries {
            if let Value::Integer(i) = key {
                items[i as usize - 1] = value;
            }
        }
        Ok(TableContents::Sequence(items))
    }

    fn summary(&self) -> String {
        match self {
            TableContents::Sequence(items) => format!("table[{}]", items.len()),
            TableContents::Mapping(entries) => format!("table{{{}}}", entries.len()),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn truncate(text: String, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text;
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
