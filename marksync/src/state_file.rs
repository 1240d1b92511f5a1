//! A [`StateStore`] kept in a file, as a stream of JSON patches.
//!
//! Each write appends one event holding the RFC 6902 patch from the previous
//! state to the new one. The first event sets up the whole state. Once the
//! stream gets long it is rewritten as a single initial event.

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use marksync_engine::store::StateStore;
use serde_json::{de::IoRead, Deserializer, Map, StreamDeserializer, Value};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::debug;

/// Rewrite the file once it has this many events.
const COMPACT_AFTER: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct StateEventMeta {
    pub time: String,
    #[serde(flatten)]
    pub other_fields: Value,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// Save the validated first event for processing by our caller
    /// (basically prepend it to the iterator)
    first_event: Option<StateEvent>,
}
impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let deserializer = Deserializer::from_reader(reader);
        let mut iter = deserializer.into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index, .. })) => {
                if index != 0 {
                    bail!("Expected initial state event with index 0, got {}", index);
                }
                ev
            }
            Some(Err(e)) => bail!(
                "State file invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("State file invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<'a, R: io::Read> Iterator for StateEventStream<'a, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next().map(|r| r.map_err(Into::into))
        }
    }
}

pub fn apply_state_event(state: &mut Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, event.patch.0.as_slice()).map_err(Into::into)
}

/// Replay `events` onto `state`, returning how many there were.
pub fn apply_state_events(
    state: &mut Value,
    events: impl Iterator<Item = Result<StateEvent>>,
) -> Result<u64> {
    let mut count = 0;
    for event in events {
        apply_state_event(state, &event?)?;
        count += 1;
    }
    Ok(count)
}

fn event(index: u64, patch: json_patch::Patch) -> StateEvent {
    StateEvent {
        index,
        meta: StateEventMeta {
            time: Utc::now().to_rfc3339(),
            other_fields: serde_json::json!({}),
        },
        patch,
    }
}

/// The event that sets up `state` from nothing.
fn init_event(state: Value) -> StateEvent {
    event(
        0,
        json_patch::Patch(vec![json_patch::PatchOperation::Add(
            json_patch::AddOperation {
                path: "".parse().expect("empty path"),
                value: state,
            },
        )]),
    )
}

fn write_events(file: &mut File, events: &[&StateEvent]) -> Result<()> {
    let mut writer = io::BufWriter::new(file);
    for event in events {
        // Pretty, so that the file can be inspected by hand
        serde_json::to_writer_pretty(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// The state and event count from the start of `file`.
fn read_state(mut file: impl io::Read + io::Seek) -> Result<(Value, u64)> {
    file.seek(io::SeekFrom::Start(0))?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    let stream = StateEventStream::open_from_reader(content.as_slice())?;
    let mut state = Value::Object(Map::new());
    let count = apply_state_events(&mut state, stream)?;
    Ok((state, count))
}

pub struct FileState {
    path: PathBuf,
    /// Serializes access from within this process; the file lock covers
    /// other processes.
    guard: Mutex<()>,
}

impl FileState {
    /// Open the state file at `path`, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileState> {
        let path = path.as_ref().to_owned();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => {
                    let mut lock = fd_lock::RwLock::new(file);
                    let mut guard = lock.write()?;
                    write_events(&mut guard, &[&init_event(Value::Object(Map::new()))])?;
                }
                // Someone else just created it
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("creating state file {}", path.display()))
                }
            }
        }
        let state = FileState {
            path,
            guard: Mutex::new(()),
        };
        // Fail early on a broken file
        state.read()?;
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening state file {}", self.path.display()))
    }

    /// The current state.
    pub fn read(&self) -> Result<Map<String, Value>> {
        let _guard = self.guard.lock().expect("mutex poisoned");
        let lock = fd_lock::RwLock::new(self.open_file()?);
        let file = lock.read()?;
        let (state, _) = read_state(&*file)
            .with_context(|| format!("reading state file {}", self.path.display()))?;
        into_object(state)
    }

    /// Number of events in the file.
    pub fn event_count(&self) -> Result<u64> {
        let _guard = self.guard.lock().expect("mutex poisoned");
        let lock = fd_lock::RwLock::new(self.open_file()?);
        let file = lock.read()?;
        Ok(read_state(&*file)?.1)
    }

    fn write(&self, entries: Map<String, Value>) -> Result<()> {
        let _guard = self.guard.lock().expect("mutex poisoned");
        let mut lock = fd_lock::RwLock::new(self.open_file()?);
        let mut file = lock.write()?;
        let (old, count) = read_state(&mut *file)
            .with_context(|| format!("reading state file {}", self.path.display()))?;

        let mut new = old.clone();
        if let Value::Object(map) = &mut new {
            map.extend(entries);
        }
        let patch = json_patch::diff(&old, &new);
        if patch.0.is_empty() {
            return Ok(());
        }

        if count >= COMPACT_AFTER {
            debug!(path = %self.path.display(), count, "compacting state file");
            file.set_len(0)?;
            write_events(&mut file, &[&init_event(new)])?;
        } else {
            write_events(&mut file, &[&event(count, patch)])?;
        }
        Ok(())
    }
}

fn into_object(state: Value) -> Result<Map<String, Value>> {
    match state {
        Value::Object(map) => Ok(map),
        other => bail!("state is not an object: {}", other),
    }
}

#[async_trait::async_trait]
impl StateStore for FileState {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>> {
        let mut state = self.read()?;
        Ok(keys
            .iter()
            .filter_map(|&key| state.remove(key).map(|v| (key.to_owned(), v)))
            .collect())
    }

    async fn set(&self, entries: Map<String, Value>) -> Result<()> {
        self.write(entries)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.read()?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2026-03-04T07:40:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "token": "t" },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2026-03-04T07:41:00Z"},
        "patch": [
            {
                "op": "add",
                "value": "gist-1",
                "path": "/documentId"
            }
        ]
    }
"#;

    fn entries(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_open_state_stream() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().index, 0);
        assert_eq!(
            events[0].as_ref().unwrap().meta.time,
            "2026-03-04T07:40:00Z"
        );
    }

    #[test]
    fn test_resolve_state() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let mut state = json!({});
        assert_eq!(apply_state_events(&mut state, stream).unwrap(), 2);
        assert_eq!(state, json!({"token": "t", "documentId": "gist-1"}));
    }

    #[test]
    fn test_open_state_stream_invalid_index() {
        let input = r#"{"index":1,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn test_open_state_stream_empty() {
        assert!(StateEventStream::open_from_reader("".as_bytes()).is_err());
    }

    #[test]
    fn test_invalid_second_event() {
        let input = r#"{"index":0,"meta":{"time":"2019-06-04T07:40:00Z"},"patch":[]}
{"meta":{"time":"2019-06-04T07:40:00Z"}}"#;
        let stream = StateEventStream::open_from_reader(input.as_bytes()).unwrap();
        let vec: Vec<Result<StateEvent>> = stream.collect();
        assert!(vec[1].is_err());
    }

    #[tokio::test]
    async fn test_file_state_set_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let state = FileState::open(&path).unwrap();
        assert!(state.keys().await.unwrap().is_empty());

        state
            .set(entries(json!({"token": "t", "documentId": "d"})))
            .await
            .unwrap();
        state.set(entries(json!({"token": "u"}))).await.unwrap();
        let got = state.get(&["token", "documentId", "missing"]).await.unwrap();
        assert_eq!(Value::Object(got), json!({"token": "u", "documentId": "d"}));
        assert_eq!(state.event_count().unwrap(), 3);

        // Unchanged values add nothing
        state.set(entries(json!({"token": "u"}))).await.unwrap();
        assert_eq!(state.event_count().unwrap(), 3);

        // Visible to another handle
        let again = FileState::open(&path).unwrap();
        assert_eq!(again.read().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_state_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = FileState::open(&path).unwrap();
        for n in 1..COMPACT_AFTER {
            state.set(entries(json!({"n": n}))).await.unwrap();
        }
        assert_eq!(state.event_count().unwrap(), COMPACT_AFTER);

        state.set(entries(json!({"n": "last"}))).await.unwrap();
        assert_eq!(state.event_count().unwrap(), 1);
        assert_eq!(Value::Object(state.read().unwrap()), json!({"n": "last"}));
    }

    #[test]
    fn test_open_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(FileState::open(&path).is_err());
    }
}
