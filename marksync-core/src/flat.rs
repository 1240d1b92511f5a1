//! Flattening a [`Value`] into `path = value` lines and back.
//!
//! ```text
//! [{"title": "A", "url": "a"}]
//! ```
//! flattens to
//! ```text
//! [] = sep
//! [].title = "A"
//! [].url = "a"
//! [] = sep
//! ```
//!
//! Every array element is bracketed by `sep` lines, so a line diff sees
//! element insertions and deletions as whole blocks. Object keys are visited
//! in sorted order. A leaf member of an object that is not inside an array is
//! preceded by a `nop` line carrying its path, which the reader ignores.

use crate::error::CodecError;
use crate::path::{self, Conflict, Path};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const SEPARATOR: &str = "sep";
pub const EMPTY_OBJECT: &str = "{}";
pub const UNDEFINED: &str = "undefined";
pub const COMPANION: &str = "nop";

/// Decides whether a value is emitted as a single JSON line instead of being
/// broken up into its members.
pub type AtomicPredicate = fn(&Value) -> bool;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenOptions {
    pub atomic: Option<AtomicPredicate>,
}

impl FlattenOptions {
    fn is_atomic(&self, value: &Value) -> bool {
        self.atomic.is_some_and(|atomic| atomic(value))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnflattenOptions {
    /// Keep every occurrence of a repeated path ([`Conflict::Append`])
    /// instead of letting the last one win.
    pub no_delete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Separator,
    EmptyObject,
    Undefined,
    Companion,
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatLine {
    pub path: Path,
    pub value: FlatValue,
}

impl FlatLine {
    pub fn new(path: Path, value: FlatValue) -> Self {
        FlatLine { path, value }
    }
}

impl fmt::Display for FlatLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = ", self.path)?;
        match &self.value {
            FlatValue::Separator => f.write_str(SEPARATOR),
            FlatValue::EmptyObject => f.write_str(EMPTY_OBJECT),
            FlatValue::Undefined => f.write_str(UNDEFINED),
            FlatValue::Companion => f.write_str(COMPANION),
            FlatValue::Json(json) => write!(f, "{}", json),
        }
    }
}

impl FromStr for FlatLine {
    type Err = CodecError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| CodecError::InvalidLine {
            line: line.to_owned(),
            reason,
        };
        let (path, rest) = Path::parse_prefix(line)?;
        let encoded = rest
            .strip_prefix(" = ")
            .ok_or_else(|| invalid("expected ' = ' after the path".to_owned()))?;
        let value = match encoded {
            SEPARATOR => FlatValue::Separator,
            EMPTY_OBJECT => FlatValue::EmptyObject,
            UNDEFINED => FlatValue::Undefined,
            COMPANION => FlatValue::Companion,
            json => {
                FlatValue::Json(serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?)
            }
        };
        if value == FlatValue::Separator && path.array_container().is_none() {
            return Err(invalid("separator path must end in []".to_owned()));
        }
        Ok(FlatLine { path, value })
    }
}

pub fn flatten(value: &Value, options: &FlattenOptions) -> Vec<FlatLine> {
    let mut out = Vec::new();
    flatten_into(value, &Path::root(), options, &mut out);
    out
}

/// [`flatten`], rendered to text lines.
pub fn flatten_lines(value: &Value, options: &FlattenOptions) -> Vec<String> {
    flatten(value, options)
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn flatten_into(value: &Value, path: &Path, options: &FlattenOptions, out: &mut Vec<FlatLine>) {
    if options.is_atomic(value) {
        out.push(FlatLine::new(path.clone(), FlatValue::Json(value.to_json())));
        return;
    }
    match value {
        Value::Array(items) => {
            let slot = path.next();
            for item in items {
                out.push(FlatLine::new(slot.clone(), FlatValue::Separator));
                flatten_into(item, &slot, options, out);
            }
            out.push(FlatLine::new(slot, FlatValue::Separator));
        }
        Value::Object(map) if map.is_empty() => {
            out.push(FlatLine::new(path.clone(), FlatValue::EmptyObject));
        }
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = path.key(key);
                if !child_path.is_in_array() && is_single_line(child, options) {
                    out.push(FlatLine::new(child_path.clone(), FlatValue::Companion));
                }
                flatten_into(child, &child_path, options, out);
            }
        }
        Value::Undefined => out.push(FlatLine::new(path.clone(), FlatValue::Undefined)),
        scalar => out.push(FlatLine::new(path.clone(), FlatValue::Json(scalar.to_json()))),
    }
}

fn is_single_line(value: &Value, options: &FlattenOptions) -> bool {
    match value {
        Value::Array(_) => options.is_atomic(value),
        Value::Object(map) => map.is_empty() || options.is_atomic(value),
        _ => true,
    }
}

/// Rebuild a value from lines produced by [`flatten`] (or a patched copy of
/// them).
pub fn unflatten<I>(lines: I, options: &UnflattenOptions) -> Result<Value, CodecError>
where
    I: IntoIterator<Item = FlatLine>,
{
    let conflict = if options.no_delete {
        Conflict::Append
    } else {
        Conflict::Overwrite
    };
    let mut root = Value::Undefined;
    for line in lines {
        let value = match line.value {
            FlatValue::Companion => continue,
            FlatValue::Separator => {
                open_slot(&mut root, &line.path)?;
                continue;
            }
            FlatValue::EmptyObject => Value::Object(BTreeMap::new()),
            FlatValue::Undefined => Value::Undefined,
            FlatValue::Json(json) => Value::from(json),
        };
        path::set(&mut root, &line.path, value, conflict)?;
    }
    trim_boundary_slots(&mut root);
    Ok(root)
}

/// Parse text lines and [`unflatten`] them.
pub fn unflatten_lines<S: AsRef<str>>(
    lines: &[S],
    options: &UnflattenOptions,
) -> Result<Value, CodecError> {
    let parsed = lines
        .iter()
        .map(|line| line.as_ref().parse::<FlatLine>())
        .collect::<Result<Vec<_>, _>>()?;
    unflatten(parsed, options)
}

/// Grow the array a separator belongs to by one undefined slot.
fn open_slot(root: &mut Value, separator_path: &Path) -> Result<(), CodecError> {
    let container = separator_path
        .array_container()
        .ok_or_else(|| CodecError::InvalidLine {
            line: format!("{} = {}", separator_path, SEPARATOR),
            reason: "separator path must end in []".to_owned(),
        })?;
    match path::set(root, &container, Value::Array(Vec::new()), Conflict::Skip)? {
        Value::Array(items) => {
            items.push(Value::Undefined);
            Ok(())
        }
        other => Err(CodecError::ShapeConflict {
            path: container.to_string(),
            expected: "array",
            found: other.kind(),
        }),
    }
}

/// Every array ends with the slot opened by its closing separator.
fn trim_boundary_slots(value: &mut Value) {
    match value {
        Value::Array(items) => {
            if items.last().is_some_and(Value::is_undefined) {
                items.pop();
            }
            items.iter_mut().for_each(trim_boundary_slots);
        }
        Value::Object(map) => map.values_mut().for_each(trim_boundary_slots),
        _ => {}
    }
}
