//! Path expressions into a [`Value`] that is being rebuilt line by line.
//!
//! A path is a sequence of object keys and `[]` tokens. `[]` addresses the
//! last slot of the array at that position, which is the slot the most
//! recent array separator opened (see [`crate::flat`]).

use crate::error::CodecError;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    /// `[]`
    Next,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(Vec<Segment>);

/// What to do when the leaf being written already holds a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Last write wins.
    Overwrite,
    /// First write wins.
    Skip,
    /// Keep every write. A filled array slot gets a sibling slot; an object
    /// member turns into (or extends) a list.
    Append,
}

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key(&self, key: &str) -> Path {
        let mut segments = self.0.clone();
        segments.push(Segment::Key(key.to_owned()));
        Path(segments)
    }

    pub fn next(&self) -> Path {
        let mut segments = self.0.clone();
        segments.push(Segment::Next);
        Path(segments)
    }

    /// Whether any segment goes through an array slot.
    pub fn is_in_array(&self) -> bool {
        self.0.contains(&Segment::Next)
    }

    /// For a path ending in `[]`, the path of the array itself.
    pub fn array_container(&self) -> Option<Path> {
        match self.0.split_last() {
            Some((Segment::Next, parent)) => Some(Path(parent.to_vec())),
            _ => None,
        }
    }

    /// Parse a path from the start of `input`, returning the unparsed rest.
    ///
    /// Parsing stops at the first character that cannot continue a path,
    /// typically the space before ` = `.
    pub fn parse_prefix(input: &str) -> Result<(Path, &str), CodecError> {
        let mut segments = Vec::new();
        let mut rest = input;
        loop {
            if let Some(after) = rest.strip_prefix("[]") {
                segments.push(Segment::Next);
                rest = after;
            } else if let Some(after) = rest.strip_prefix('[') {
                let mut stream = serde_json::Deserializer::from_str(after).into_iter::<String>();
                let key = match stream.next() {
                    Some(Ok(key)) => key,
                    _ => return Err(invalid_path(input, "expected a quoted key after '['")),
                };
                let after = &after[stream.byte_offset()..];
                rest = after
                    .strip_prefix(']')
                    .ok_or_else(|| invalid_path(input, "expected ']' after quoted key"))?;
                segments.push(Segment::Key(key));
            } else if let Some(after) = rest.strip_prefix('.') {
                let (ident, after) = split_identifier(after);
                if ident.is_empty() {
                    return Err(invalid_path(input, "expected a key after '.'"));
                }
                segments.push(Segment::Key(ident.to_owned()));
                rest = after;
            } else if segments.is_empty() && rest.starts_with(is_identifier_char) {
                // A bare leading identifier
                let (ident, after) = split_identifier(rest);
                segments.push(Segment::Key(ident.to_owned()));
                rest = after;
            } else {
                break;
            }
        }
        Ok((Path(segments), rest))
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_identifier_char)
}

fn split_identifier(s: &str) -> (&str, &str) {
    let end = s.find(|c| !is_identifier_char(c)).unwrap_or(s.len());
    s.split_at(end)
}

fn invalid_path(path: &str, reason: &str) -> CodecError {
    CodecError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            match segment {
                Segment::Next => write!(f, "[]")?,
                Segment::Key(key) if is_identifier(key) => write!(f, ".{}", key)?,
                Segment::Key(key) => write!(f, "[{}]", serde_json::Value::String(key.clone()))?,
            }
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, rest) = Path::parse_prefix(s)?;
        if !rest.is_empty() {
            return Err(invalid_path(s, "trailing characters"));
        }
        Ok(path)
    }
}

/// Write `value` at `path` inside `root`, creating containers on demand.
///
/// An `Undefined` slot counts as absent: a key segment turns it into an
/// object, a `[]` segment into an array with one open slot. Descending
/// through any other non-container is a [`CodecError::ShapeConflict`].
///
/// Returns the leaf slot after the write, so callers can keep working on the
/// value that ended up there (which under [`Conflict::Skip`] may be the
/// pre-existing one).
pub fn set<'a>(
    root: &'a mut Value,
    path: &Path,
    value: Value,
    conflict: Conflict,
) -> Result<&'a mut Value, CodecError> {
    let mut slot = root;
    let count = path.0.len();
    for (index, segment) in path.0.iter().enumerate() {
        let is_leaf = index + 1 == count;
        slot = match segment {
            Segment::Key(key) => {
                if slot.is_undefined() {
                    *slot = Value::Object(BTreeMap::new());
                }
                match slot {
                    Value::Object(map) => map.entry(key.clone()).or_insert(Value::Undefined),
                    other => return Err(shape_conflict(path, "object", other)),
                }
            }
            Segment::Next => {
                if slot.is_undefined() {
                    *slot = Value::Array(Vec::new());
                }
                match slot {
                    Value::Array(items) => {
                        let open_sibling = is_leaf
                            && conflict == Conflict::Append
                            && items.last().is_some_and(|last| !last.is_undefined());
                        if items.is_empty() || open_sibling {
                            items.push(Value::Undefined);
                        }
                        let last = items.len() - 1;
                        &mut items[last]
                    }
                    other => return Err(shape_conflict(path, "array", other)),
                }
            }
        };
    }

    match conflict {
        Conflict::Overwrite => *slot = value,
        Conflict::Skip => {
            if slot.is_undefined() {
                *slot = value;
            }
        }
        Conflict::Append => {
            if slot.is_undefined() {
                *slot = value;
            } else if let Value::Array(items) = slot {
                items.push(value);
            } else {
                let previous = std::mem::take(slot);
                *slot = Value::Array(vec![previous, value]);
            }
        }
    }
    Ok(slot)
}

fn shape_conflict(path: &Path, expected: &'static str, found: &Value) -> CodecError {
    CodecError::ShapeConflict {
        path: path.to_string(),
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let path = p(".a[].b[]");
        assert_eq!(
            path.segments(),
            &[
                Segment::Key("a".into()),
                Segment::Next,
                Segment::Key("b".into()),
                Segment::Next
            ]
        );
        assert_eq!(path.to_string(), ".a[].b[]");
    }

    #[test]
    fn test_bare_leading_identifier() {
        assert_eq!(p("toolbar[]"), Path::root().key("toolbar").next());
        assert_eq!(p("toolbar[]").to_string(), ".toolbar[]");
    }

    #[test]
    fn test_quoted_keys() {
        let path = Path::root().key("with space").key("").key("q\"uote");
        let s = path.to_string();
        assert_eq!(s, r#"["with space"][""]["q\"uote"]"#);
        assert_eq!(p(&s), path);
    }

    #[test]
    fn test_parse_prefix_stops_at_space() {
        let (path, rest) = Path::parse_prefix(".a[] = 1").unwrap();
        assert_eq!(path, Path::root().key("a").next());
        assert_eq!(rest, " = 1");

        let (path, rest) = Path::parse_prefix(" = 1").unwrap();
        assert!(path.is_root());
        assert_eq!(rest, " = 1");
    }

    #[test]
    fn test_parse_errors() {
        assert!(".".parse::<Path>().is_err());
        assert!(r#"["open"#.parse::<Path>().is_err());
        assert!(r#"["a""#.parse::<Path>().is_err());
        assert!(".a b".parse::<Path>().is_err());
    }

    #[test]
    fn test_array_container() {
        assert_eq!(p(".a[]").array_container(), Some(p(".a")));
        assert_eq!(p("[]").array_container(), Some(Path::root()));
        assert_eq!(p(".a").array_container(), None);
        assert!(p(".a[].b").is_in_array());
        assert!(!p(".a.b").is_in_array());
    }

    #[test]
    fn test_set_builds_containers() {
        let mut root = Value::Undefined;
        set(&mut root, &p(".a.b"), Value::from(1), Conflict::Overwrite).unwrap();
        set(&mut root, &p(".a.c[]"), Value::from("x"), Conflict::Overwrite).unwrap();
        assert_eq!(root.to_json(), json!({"a": {"b": 1, "c": ["x"]}}));
    }

    #[test]
    fn test_set_next_addresses_last_slot() {
        let mut root = Value::Array(vec![Value::from(1), Value::Undefined]);
        set(&mut root, &p("[]"), Value::from(2), Conflict::Overwrite).unwrap();
        assert_eq!(root, Value::Array(vec![Value::from(1), Value::from(2)]));
    }

    #[test]
    fn test_set_overwrite_and_skip() {
        let mut root = Value::Undefined;
        set(&mut root, &p(".a"), Value::from(1), Conflict::Overwrite).unwrap();
        set(&mut root, &p(".a"), Value::from(2), Conflict::Overwrite).unwrap();
        assert_eq!(root.to_json(), json!({"a": 2}));

        let existing = set(&mut root, &p(".a"), Value::from(3), Conflict::Skip).unwrap();
        assert_eq!(*existing, Value::from(2));
    }

    #[test]
    fn test_set_skip_returns_live_array() {
        let mut root = Value::Undefined;
        let arr = set(&mut root, &p(".list"), Value::Array(vec![]), Conflict::Skip).unwrap();
        if let Value::Array(items) = arr {
            items.push(Value::from(7));
        }
        let arr = set(&mut root, &p(".list"), Value::Array(vec![]), Conflict::Skip).unwrap();
        assert_eq!(*arr, Value::Array(vec![Value::from(7)]));
    }

    #[test]
    fn test_set_append_object_member() {
        let mut root = Value::Undefined;
        set(&mut root, &p(".a"), Value::from(1), Conflict::Append).unwrap();
        set(&mut root, &p(".a"), Value::from(2), Conflict::Append).unwrap();
        set(&mut root, &p(".a"), Value::from(3), Conflict::Append).unwrap();
        assert_eq!(root.to_json(), json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn test_set_append_array_slot_opens_sibling() {
        let mut root = Value::Array(vec![Value::Undefined]);
        set(&mut root, &p("[]"), Value::from("a"), Conflict::Append).unwrap();
        set(&mut root, &p("[]"), Value::from("b"), Conflict::Append).unwrap();
        assert_eq!(root.to_json(), json!(["a", "b"]));
    }

    #[test]
    fn test_set_shape_conflict() {
        let mut root = Value::Undefined;
        set(&mut root, &p(".a"), Value::from(1), Conflict::Overwrite).unwrap();
        let err = set(&mut root, &p(".a.b"), Value::from(2), Conflict::Overwrite).unwrap_err();
        assert!(matches!(
            err,
            CodecError::ShapeConflict {
                expected: "object",
                found: "number",
                ..
            }
        ));
        let err = set(&mut root, &p("[]"), Value::from(2), Conflict::Overwrite).unwrap_err();
        assert!(matches!(err, CodecError::ShapeConflict { expected, .. } if expected == "array"));
    }
}
