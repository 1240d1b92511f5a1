//! Line diffs over the flattened form of two values.
//!
//! [`diff`] flattens both sides, runs a Myers line diff and renders the
//! result as unified diff text. [`apply`] flattens a target, locates each
//! hunk by its context (allowing the target to have drifted a little from
//! the base the patch was computed against) and rebuilds the value.

use crate::error::PatchError;
use crate::flat::{self, AtomicPredicate, FlatLine, FlattenOptions, UnflattenOptions};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp, DiffTag};
use std::fmt::Write as _;

/// Context lines around each change.
pub const DEFAULT_CONTEXT: usize = 1;

/// Context lines per hunk that may mismatch the target during [`apply`].
pub const DEFAULT_FUZZ: usize = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Turn removals into context, so the patch only ever adds.
    pub no_delete: bool,
    pub atomic: Option<AtomicPredicate>,
    /// Overrides [`default_context`].
    pub context: Option<usize>,
}

/// The options a patch was made with. Applying it flattens and rebuilds the
/// target with the same options.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOptions {
    pub no_delete: bool,
    /// Not part of the serialized form; whoever deserializes a patch has to
    /// put the predicate back.
    #[serde(skip)]
    pub atomic: Option<AtomicPredicate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub text: String,
    pub options: PatchOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 0-based index of the first old line covered.
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

/// Context for a diff whose old side has `line_count` lines: [`DEFAULT_CONTEXT`],
/// but never more than half of a very short input.
pub fn default_context(line_count: usize) -> usize {
    DEFAULT_CONTEXT.min(line_count / 2)
}

/// Compute the patch turning `a` into `b`, or `None` when their flattened
/// forms are identical.
pub fn diff(a: &Value, b: &Value, options: &DiffOptions) -> Option<Patch> {
    let flatten_options = FlattenOptions {
        atomic: options.atomic,
    };
    let old = flat::flatten_lines(a, &flatten_options);
    let new = flat::flatten_lines(b, &flatten_options);
    let context = options
        .context
        .unwrap_or_else(|| default_context(old.len()));

    let ops = similar::capture_diff_slices(Algorithm::Myers, &old, &new);
    let groups = similar::group_diff_ops(ops, context);
    if groups.is_empty() {
        return None;
    }

    let mut hunks: Vec<Hunk> = groups
        .iter()
        .map(|group| Hunk::from_ops(group, &old, &new))
        .collect();
    if options.no_delete {
        hunks.iter_mut().for_each(Hunk::keep_removed);
    }

    Some(Patch {
        text: format_hunks(&hunks),
        options: PatchOptions {
            no_delete: options.no_delete,
            atomic: options.atomic,
        },
    })
}

/// Apply `patch` to `target`.
pub fn apply(target: &Value, patch: &Patch) -> Result<Value, PatchError> {
    let hunks = parse_hunks(&patch.text)?;
    let lines = flat::flatten_lines(
        target,
        &FlattenOptions {
            atomic: patch.options.atomic,
        },
    );
    let patched = apply_hunks(&lines, &hunks, DEFAULT_FUZZ)?;
    let parsed = patched
        .iter()
        .map(|line| line.parse::<FlatLine>())
        .collect::<Result<Vec<_>, _>>()?;
    let value = flat::unflatten(
        parsed,
        &UnflattenOptions {
            no_delete: patch.options.no_delete,
        },
    )?;
    Ok(value)
}

impl Patch {
    pub fn hunks(&self) -> Result<Vec<Hunk>, PatchError> {
        parse_hunks(&self.text)
    }
}

impl Hunk {
    fn from_ops(ops: &[DiffOp], old: &[String], new: &[String]) -> Hunk {
        let mut lines = Vec::new();
        for op in ops {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => {
                    lines.extend(old[old_range].iter().cloned().map(HunkLine::Context));
                }
                DiffTag::Delete => {
                    lines.extend(old[old_range].iter().cloned().map(HunkLine::Remove));
                }
                DiffTag::Insert => {
                    lines.extend(new[new_range].iter().cloned().map(HunkLine::Add));
                }
                DiffTag::Replace => {
                    lines.extend(old[old_range].iter().cloned().map(HunkLine::Remove));
                    lines.extend(new[new_range].iter().cloned().map(HunkLine::Add));
                }
            }
        }
        let (old_start, new_start) = ops
            .first()
            .map(|op| (op.old_range().start, op.new_range().start))
            .unwrap_or((0, 0));
        let mut hunk = Hunk {
            old_start,
            old_len: 0,
            new_start,
            new_len: 0,
            lines,
        };
        hunk.recount();
        hunk
    }

    fn recount(&mut self) {
        self.old_len = self
            .lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Add(_)))
            .count();
        self.new_len = self
            .lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Remove(_)))
            .count();
    }

    /// Rewrite removals as context. The new side grows by one line per
    /// rewritten removal.
    fn keep_removed(&mut self) {
        for line in self.lines.iter_mut() {
            if let HunkLine::Remove(text) = line {
                *line = HunkLine::Context(std::mem::take(text));
            }
        }
        self.recount();
    }

    fn old_lines(&self) -> impl Iterator<Item = &HunkLine> {
        self.lines.iter().filter(|l| !matches!(l, HunkLine::Add(_)))
    }

    fn context_count(&self) -> usize {
        self.old_lines()
            .filter(|l| matches!(l, HunkLine::Context(_)))
            .count()
    }
}

/// Unified range start: 1-based, or the line before when the range is empty.
fn range_start(start: usize, len: usize) -> usize {
    if len == 0 {
        start
    } else {
        start + 1
    }
}

fn format_hunks(hunks: &[Hunk]) -> String {
    let mut out = String::from("--- a\n+++ b\n");
    for hunk in hunks {
        // Writing to a String cannot fail
        let _ = writeln!(
            out,
            "@@ -{},{} +{},{} @@",
            range_start(hunk.old_start, hunk.old_len),
            hunk.old_len,
            range_start(hunk.new_start, hunk.new_len),
            hunk.new_len
        );
        for line in &hunk.lines {
            let (prefix, text) = match line {
                HunkLine::Context(t) => (' ', t),
                HunkLine::Remove(t) => ('-', t),
                HunkLine::Add(t) => ('+', t),
            };
            out.push(prefix);
            out.push_str(text);
            out.push('\n');
        }
    }
    out
}

fn parse_hunks(text: &str) -> Result<Vec<Hunk>, PatchError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut hunks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with("@@") {
            if hunks.is_empty() || line.is_empty() {
                // Headers before the first hunk
                i += 1;
                continue;
            }
            return Err(malformed(i, "expected a hunk header"));
        }
        let (old_start, old_len, new_start, new_len) =
            parse_hunk_header(line).ok_or_else(|| malformed(i, "invalid hunk header"))?;
        i += 1;

        let mut body = Vec::new();
        let (mut old_left, mut new_left) = (old_len, new_len);
        while old_left > 0 || new_left > 0 {
            let line = *lines
                .get(i)
                .ok_or_else(|| malformed(i, "hunk is shorter than its header says"))?;
            let mut chars = line.chars();
            let hunk_line = match chars.next() {
                Some(' ') if old_left > 0 && new_left > 0 => {
                    old_left -= 1;
                    new_left -= 1;
                    HunkLine::Context(chars.as_str().to_owned())
                }
                Some('-') if old_left > 0 => {
                    old_left -= 1;
                    HunkLine::Remove(chars.as_str().to_owned())
                }
                Some('+') if new_left > 0 => {
                    new_left -= 1;
                    HunkLine::Add(chars.as_str().to_owned())
                }
                Some('\\') => {
                    // "\ No newline at end of file"
                    i += 1;
                    continue;
                }
                _ => return Err(malformed(i, "unexpected line in hunk")),
            };
            body.push(hunk_line);
            i += 1;
        }

        hunks.push(Hunk {
            old_start: index_from_range_start(old_start, old_len),
            old_len,
            new_start: index_from_range_start(new_start, new_len),
            new_len,
            lines: body,
        });
    }
    Ok(hunks)
}

fn index_from_range_start(start: usize, len: usize) -> usize {
    if len == 0 {
        start
    } else {
        start.saturating_sub(1)
    }
}

/// Parse `@@ -1,3 +1,4 @@`. A missing length means 1.
fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let inner = line.strip_prefix("@@ ")?;
    let end = inner.find(" @@")?;
    let mut parts = inner[..end].split(' ');
    let (old_start, old_len) = parse_range(parts.next()?.strip_prefix('-')?)?;
    let (new_start, new_len) = parse_range(parts.next()?.strip_prefix('+')?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((old_start, old_len, new_start, new_len))
}

fn parse_range(s: &str) -> Option<(usize, usize)> {
    match s.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

fn malformed(index: usize, reason: &str) -> PatchError {
    PatchError::Malformed {
        line: index + 1,
        reason: reason.to_owned(),
    }
}

fn apply_hunks(target: &[String], hunks: &[Hunk], fuzz: usize) -> Result<Vec<String>, PatchError> {
    let mut out = Vec::with_capacity(target.len());
    let mut cursor = 0;
    let mut offset: isize = 0;
    for (n, hunk) in hunks.iter().enumerate() {
        let expected = (hunk.old_start as isize + offset)
            .clamp(cursor as isize, target.len() as isize) as usize;
        let position = locate(target, hunk, cursor, expected, fuzz)
            .ok_or(PatchError::NoMatch { hunk: n + 1 })?;

        out.extend_from_slice(&target[cursor..position]);
        let mut at = position;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(_) => {
                    // Keep the target's text; it may differ under fuzz
                    out.push(target[at].clone());
                    at += 1;
                }
                HunkLine::Remove(_) => at += 1,
                HunkLine::Add(text) => out.push(text.clone()),
            }
        }
        cursor = at;
        offset = position as isize - hunk.old_start as isize;
    }
    out.extend_from_slice(&target[cursor..]);
    Ok(out)
}

/// Find where `hunk` applies, trying positions from `expected` outward,
/// first exactly and then with increasing fuzz.
fn locate(
    target: &[String],
    hunk: &Hunk,
    min: usize,
    expected: usize,
    fuzz: usize,
) -> Option<usize> {
    if min + hunk.old_len > target.len() {
        return None;
    }
    let max = target.len() - hunk.old_len;
    let expected = expected.clamp(min, max);
    let candidates = || {
        let below = (min..expected).rev().map(Some);
        let above = (expected..=max).map(Some);
        // Interleave: expected, expected+1, expected-1, expected+2, ...
        let mut above = above.chain(std::iter::repeat(None));
        let mut below = below.chain(std::iter::repeat(None));
        std::iter::from_fn(move || match (above.next(), below.next()) {
            (Some(None), Some(None)) => None,
            (a, b) => Some([a.flatten(), b.flatten()]),
        })
        .flatten()
        .flatten()
    };
    (0..=fuzz).find_map(|allowed| candidates().find(|&p| matches_at(target, hunk, p, allowed)))
}

fn matches_at(target: &[String], hunk: &Hunk, position: usize, allowed: usize) -> bool {
    let mut mismatches = 0;
    for (k, line) in hunk.old_lines().enumerate() {
        let actual = &target[position + k];
        match line {
            HunkLine::Context(text) if text != actual => mismatches += 1,
            HunkLine::Remove(text) if text != actual => return false,
            _ => {}
        }
    }
    if mismatches == 0 {
        return true;
    }
    let anchored = hunk.context_count() > mismatches
        || hunk.old_lines().any(|l| matches!(l, HunkLine::Remove(_)));
    mismatches <= allowed && anchored
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    fn bookmark(title: &str, url: &str) -> serde_json::Value {
        json!({"title": title, "url": url})
    }

    fn is_bookmark(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|m| m.contains_key("url") && !m.contains_key("children"))
    }

    #[test]
    fn test_replace_tail_applies_to_shorter_target() {
        let patch = diff(
            &v(json!([1, 2, 3])),
            &v(json!([1, 2, 4, 5])),
            &DiffOptions::default(),
        )
        .unwrap();
        let result = apply(&v(json!([3])), &patch).unwrap();
        assert_eq!(result, v(json!([4, 5])));
    }

    #[test]
    fn test_no_change() {
        let value = v(json!([1, 2, 3]));
        assert!(diff(&value, &value, &DiffOptions::default()).is_none());
        let value = v(json!({"a": [bookmark("A", "a")], "b": {}}));
        assert!(diff(&value, &value, &DiffOptions::default()).is_none());
        assert!(diff(&Value::Undefined, &Value::Undefined, &DiffOptions::default()).is_none());
    }

    #[test]
    fn test_remove_survives_unrelated_edit() {
        let before = v(json!([bookmark("A", "a"), bookmark("B", "b"), bookmark("C", "c")]));
        let after = v(json!([bookmark("A", "a"), bookmark("C", "c")]));
        let remote = v(json!([bookmark("A", "X"), bookmark("B", "b"), bookmark("C", "c")]));
        let patch = diff(&before, &after, &DiffOptions::default()).unwrap();
        let result = apply(&remote, &patch).unwrap();
        assert_eq!(result, v(json!([bookmark("A", "X"), bookmark("C", "c")])));
    }

    #[test]
    fn test_insert_survives_unrelated_edit() {
        let before = v(json!([bookmark("A", "a"), bookmark("C", "c")]));
        let after = v(json!([bookmark("A", "a"), bookmark("B", "b"), bookmark("C", "c")]));
        let remote = v(json!([bookmark("A", "X"), bookmark("C", "c")]));
        let patch = diff(&before, &after, &DiffOptions::default()).unwrap();
        let result = apply(&remote, &patch).unwrap();
        assert_eq!(
            result,
            v(json!([bookmark("A", "X"), bookmark("B", "b"), bookmark("C", "c")]))
        );
    }

    #[test]
    fn test_insert_with_new_remote_item_in_front() {
        let before = v(json!([bookmark("A", "a"), bookmark("C", "c")]));
        let after = v(json!([bookmark("A", "a"), bookmark("B", "b"), bookmark("C", "c")]));
        let remote = v(json!([bookmark("O", "o"), bookmark("A", "a"), bookmark("C", "c")]));
        let patch = diff(&before, &after, &DiffOptions::default()).unwrap();
        let result = apply(&remote, &patch).unwrap();
        assert_eq!(
            result,
            v(json!([
                bookmark("O", "o"),
                bookmark("A", "a"),
                bookmark("B", "b"),
                bookmark("C", "c")
            ]))
        );
    }

    #[test]
    fn test_apply_to_base_reproduces_target() {
        let pairs = [
            (json!([]), json!([1])),
            (json!([1]), json!([])),
            (json!({"a": 1}), json!({"a": 2, "b": [true]})),
            (json!({"a": {"b": [1, 2]}}), json!({"a": {}})),
            (json!(null), json!({"x": "y"})),
            (
                json!([{"type": "folder", "title": "F", "children": [bookmark("A", "a")]}]),
                json!([{
                    "type": "folder",
                    "title": "G",
                    "children": [bookmark("A", "a"), {"type": "separator"}]
                }]),
            ),
            (
                json!([
                    bookmark("A", "a"),
                    bookmark("B", "b"),
                    bookmark("C", "c"),
                    bookmark("D", "d")
                ]),
                json!([bookmark("D", "d"), bookmark("B", "b"), bookmark("A", "a")]),
            ),
        ];
        for (a, b) in pairs {
            let (a, b) = (v(a), v(b));
            for atomic in [None, Some(is_bookmark as AtomicPredicate)] {
                let options = DiffOptions {
                    atomic,
                    ..Default::default()
                };
                let patch = diff(&a, &b, &options).unwrap();
                assert_eq!(apply(&a, &patch).unwrap(), b, "patch:\n{}", patch.text);
            }
        }
    }

    #[test]
    fn test_no_delete_atomic_keeps_both_sides() {
        let local = v(json!([bookmark("A", "u"), bookmark("C", "c"), bookmark("G", "g")]));
        let remote = v(json!([bookmark("B", "b"), bookmark("D", "d"), bookmark("G", "g")]));
        let options = DiffOptions {
            no_delete: true,
            atomic: Some(is_bookmark as AtomicPredicate),
            ..Default::default()
        };
        let patch = diff(&remote, &local, &options).unwrap();
        let result = apply(&remote, &patch).unwrap();
        assert_eq!(
            result,
            v(json!([
                bookmark("B", "b"),
                bookmark("A", "u"),
                bookmark("D", "d"),
                bookmark("C", "c"),
                bookmark("G", "g")
            ]))
        );
    }

    #[test]
    fn test_no_delete_never_shrinks() {
        let cases = [
            (
                json!([bookmark("A", "a"), bookmark("B", "X"), bookmark("C", "c")]),
                json!([bookmark("A", "u"), bookmark("C", "c"), bookmark("D", "d")]),
            ),
            (
                json!([bookmark("B", "b"), bookmark("D", "d")]),
                json!([bookmark("A", "u"), bookmark("C", "c")]),
            ),
            (json!([1, 2, 3, 4]), json!([])),
            (json!([1, 2, 3, 4]), json!([4, 3])),
        ];
        for (remote, local) in cases {
            let (remote, local) = (v(remote), v(local));
            let options = DiffOptions {
                no_delete: true,
                ..Default::default()
            };
            let patch = diff(&remote, &local, &options).unwrap();
            assert!(patch.hunks().unwrap().iter().all(|h| h
                .lines
                .iter()
                .all(|l| !matches!(l, HunkLine::Remove(_)))));
            let result = apply(&remote, &patch).unwrap();
            let before = remote.as_array().unwrap();
            let after = result.as_array().unwrap();
            assert!(after.len() >= before.len(), "{:?} -> {:?}", before, after);
            // every original title survives somewhere in the result
            let rendered = serde_json::to_string(&result).unwrap();
            for item in before {
                let title = item.as_object().map_or(item, |m| &m["title"]);
                let needle = serde_json::to_string(title).unwrap();
                assert!(rendered.contains(&needle), "{} missing from {}", needle, rendered);
            }
        }
    }

    #[test]
    fn test_patch_text_format() {
        let patch = diff(&v(json!([1, 2, 3])), &v(json!([1, 3])), &DiffOptions::default()).unwrap();
        assert_eq!(
            patch.text,
            "--- a\n+++ b\n@@ -3,4 +3,2 @@\n [] = sep\n-[] = 2\n-[] = sep\n [] = 3\n"
        );
        let hunks = patch.hunks().unwrap();
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].old_start, 2);
        assert_eq!(hunks[0].old_len, 4);
        assert_eq!(hunks[0].new_len, 2);
    }

    #[test]
    fn test_no_delete_header_counts() {
        let options = DiffOptions {
            no_delete: true,
            ..Default::default()
        };
        let patch = diff(&v(json!([1, 2, 3])), &v(json!([1, 3])), &options).unwrap();
        assert_eq!(
            patch.text,
            "--- a\n+++ b\n@@ -3,4 +3,4 @@\n [] = sep\n [] = 2\n [] = sep\n [] = 3\n"
        );
    }

    #[test]
    fn test_patch_serialization() {
        let patch = diff(&v(json!([1])), &v(json!([2])), &DiffOptions::default()).unwrap();
        let encoded = serde_json::to_value(&patch).unwrap();
        assert_eq!(encoded["options"], json!({"noDelete": false}));
        let decoded: Patch = serde_json::from_value(encoded).unwrap();
        assert_eq!(apply(&v(json!([1])), &decoded).unwrap(), v(json!([2])));
    }

    #[test]
    fn test_apply_mismatch_fails() {
        let patch = diff(
            &v(json!([bookmark("A", "a"), bookmark("B", "b")])),
            &v(json!([bookmark("A", "a")])),
            &DiffOptions::default(),
        )
        .unwrap();
        let err = apply(&v(json!([bookmark("X", "x"), bookmark("Y", "y")])), &patch).unwrap_err();
        assert_eq!(err, PatchError::NoMatch { hunk: 1 });
    }

    #[test]
    fn test_parse_malformed() {
        let patch = Patch {
            text: "--- a\n+++ b\n@@ -1,2 +1,1 @@\n [] = sep\n".to_owned(),
            options: PatchOptions::default(),
        };
        assert!(matches!(patch.hunks(), Err(PatchError::Malformed { .. })));

        let patch = Patch {
            text: "@@ -1 +1 @@\n-[] = 1\n+[] = 2\n".to_owned(),
            options: PatchOptions::default(),
        };
        let hunks = patch.hunks().unwrap();
        assert_eq!(hunks[0].old_start, 0);
        assert_eq!(hunks[0].old_len, 1);

        let patch = Patch {
            text: "@@ -x +1 @@\n".to_owned(),
            options: PatchOptions::default(),
        };
        assert!(patch.hunks().is_err());
    }

    #[test]
    fn test_default_context() {
        assert_eq!(default_context(0), 0);
        assert_eq!(default_context(1), 0);
        assert_eq!(default_context(2), 1);
        assert_eq!(default_context(100), DEFAULT_CONTEXT);
    }
}
