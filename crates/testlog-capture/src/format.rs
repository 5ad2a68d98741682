//! Console argument values and their rendering
//!
//! Arguments may be plain strings, JSON values, or shared objects. Shared
//! objects can reference each other (including themselves), so rendering
//! tracks the ancestor chain and prints `[Circular]` instead of recursing
//! into an object that is already being rendered.

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Marker emitted in place of a cyclic reference
pub const CIRCULAR_MARKER: &str = "[Circular]";

/// Marker emitted once nesting exceeds [`MAX_DEPTH`]
pub const DEPTH_MARKER: &str = "[Object]";

/// Maximum object nesting rendered before eliding
pub const MAX_DEPTH: usize = 16;

/// One argument passed to a console method
#[derive(Clone)]
pub enum ConsoleArg {
    Str(String),
    Value(Value),
    Object(Arc<ArgObject>),
}

impl fmt::Debug for ConsoleArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render_arg(self))
    }
}

impl From<&str> for ConsoleArg {
    fn from(s: &str) -> Self {
        ConsoleArg::Str(s.to_string())
    }
}

impl From<String> for ConsoleArg {
    fn from(s: String) -> Self {
        ConsoleArg::Str(s)
    }
}

impl From<Value> for ConsoleArg {
    fn from(v: Value) -> Self {
        ConsoleArg::Value(v)
    }
}

impl From<Arc<ArgObject>> for ConsoleArg {
    fn from(o: Arc<ArgObject>) -> Self {
        ConsoleArg::Object(o)
    }
}

macro_rules! arg_from_number {
    ($($t:ty),*) => {
        $(impl From<$t> for ConsoleArg {
            fn from(n: $t) -> Self {
                ConsoleArg::Value(Value::from(n))
            }
        })*
    };
}

arg_from_number!(i32, i64, u32, u64, usize, f64, bool);

/// Mutable key/value object that may participate in reference cycles
#[derive(Default)]
pub struct ArgObject {
    fields: RwLock<Vec<(String, ConsoleArg)>>,
}

impl ArgObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts or replaces a field.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ConsoleArg>) {
        let key = key.into();
        let value = value.into();
        let mut fields = self.fields.write();
        match fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => fields.push((key, value)),
        }
    }
}

/// Renders arguments the way a terminal console would: space separated,
/// strings verbatim, everything else as compact JSON.
pub fn render_args(args: &[ConsoleArg]) -> String {
    args.iter().map(render_arg).collect::<Vec<_>>().join(" ")
}

pub fn render_arg(arg: &ConsoleArg) -> String {
    match arg {
        ConsoleArg::Str(s) => s.clone(),
        other => to_json(other, &mut Vec::new()).to_string(),
    }
}

/// JSON form of every argument, for structured storage on an entry.
pub fn args_to_json(args: &[ConsoleArg]) -> Vec<Value> {
    args.iter().map(|a| to_json(a, &mut Vec::new())).collect()
}

fn to_json(arg: &ConsoleArg, ancestors: &mut Vec<*const ArgObject>) -> Value {
    match arg {
        ConsoleArg::Str(s) => Value::String(s.clone()),
        ConsoleArg::Value(v) => v.clone(),
        ConsoleArg::Object(obj) => {
            let ptr = Arc::as_ptr(obj);
            if ancestors.contains(&ptr) {
                return Value::String(CIRCULAR_MARKER.to_string());
            }
            if ancestors.len() >= MAX_DEPTH {
                return Value::String(DEPTH_MARKER.to_string());
            }

            ancestors.push(ptr);
            // Snapshot the fields so no lock is held while recursing.
            let fields: Vec<(String, ConsoleArg)> = obj.fields.read().clone();
            let mut map = serde_json::Map::new();
            for (key, value) in &fields {
                map.insert(key.clone(), to_json(value, ancestors));
            }
            ancestors.pop();
            Value::Object(map)
        }
    }
}
