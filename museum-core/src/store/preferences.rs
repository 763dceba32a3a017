//! Preferences Persistence
//!
//! Nested preference values kept in a key/value medium. Everything lives in
//! one JSON blob under [`STORAGE_KEY`]; preferences occupy the
//! [`PREFERENCES_ROOT`] object inside it. Paths are `.`-separated keys into
//! that tree.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;
use crate::reactive::{Invalidate, Observer, Readable, Signal, Subscription};

/// Key of the blob holding every stored value.
pub const STORAGE_KEY: &str = "mmap:storage";

/// Root path of the preferences object inside the blob.
pub const PREFERENCES_ROOT: &str = "preferences";

/// A string key/value medium.
pub trait KeyValueStorage: Send + Sync + 'static {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-process storage. Used for session preferences and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Storage backed by one JSON object file mapping keys to strings.
///
/// Writes go to a sibling temp file that is then renamed over the target.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(items)) => Ok(items),
            _ => {
                warn!(path = %self.path.display(), "storage file is corrupt; starting empty");
                Ok(Map::new())
            }
        }
    }

    fn save(&self, items: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(items)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self
            .load()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut items = self.load()?;
        items.insert(key.to_string(), Value::String(value.to_string()));
        self.save(&items)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut items = self.load()?;
        if items.remove(key).is_some() {
            self.save(&items)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Path helpers
// ----------------------------------------------------------------------------

/// Value at `path` inside `root`, if every segment exists.
pub fn read_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |current, segment| current.as_object()?.get(segment))
}

/// Set `path` inside `root`, creating intermediate objects. A non-object
/// found on the way is replaced by an empty object.
pub fn write_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let node = std::mem::take(root);
    *root = with_path(node, &segments, value);
}

fn with_path(node: Value, segments: &[&str], leaf: Value) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return leaf;
    };
    let mut object = match node {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    let slot = object.entry(head.to_string()).or_insert(Value::Null);
    let child = std::mem::take(slot);
    *slot = with_path(child, rest, leaf);
    Value::Object(object)
}

/// Remove the leaf at `path`. Missing intermediates make this a no-op.
pub fn remove_path(root: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (read_path_mut(root, parent), leaf),
        None => (Some(root), path),
    };
    if let Some(Value::Object(object)) = parent {
        object.remove(leaf);
    }
}

fn read_path_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(root, |current, segment| current.as_object_mut()?.get_mut(segment))
}

/// Read and parse the blob. A corrupt blob is treated as empty.
fn read_blob(storage: &dyn KeyValueStorage) -> Result<Value> {
    let Some(data) = storage.get_item(STORAGE_KEY)? else {
        return Ok(Value::Object(Map::new()));
    };
    match serde_json::from_str::<Value>(&data) {
        Ok(blob @ Value::Object(_)) => Ok(blob),
        Ok(_) | Err(_) => {
            warn!(key = STORAGE_KEY, "stored preferences are corrupt; resetting");
            Ok(Value::Object(Map::new()))
        }
    }
}

fn write_blob(storage: &dyn KeyValueStorage, blob: &Value) -> Result<()> {
    storage.set_item(STORAGE_KEY, &serde_json::to_string(blob)?)
}

/// Write `value` at `path` in the stored blob and return the updated blob.
pub fn store_value(storage: &dyn KeyValueStorage, path: &str, value: Value) -> Result<Value> {
    let mut blob = read_blob(storage)?;
    write_path(&mut blob, path, value);
    write_blob(storage, &blob)?;
    Ok(blob)
}

/// The stored value at `path`, or `default` when absent.
pub fn load_value(storage: &dyn KeyValueStorage, path: &str, default: Value) -> Result<Value> {
    let blob = read_blob(storage)?;
    Ok(read_path(&blob, path).cloned().unwrap_or(default))
}

/// Remove the stored value at `path` and return the updated blob.
pub fn delete_value(storage: &dyn KeyValueStorage, path: &str) -> Result<Value> {
    let mut blob = read_blob(storage)?;
    remove_path(&mut blob, path);
    write_blob(storage, &blob)?;
    Ok(blob)
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

/// Reactive view of the preferences object in one storage medium.
#[derive(Clone)]
pub struct Preferences {
    storage: Arc<dyn KeyValueStorage>,
    current: Signal<Value>,
    write: Arc<Mutex<()>>,
}

impl Preferences {
    /// Load the preferences held in `storage`.
    pub fn open(storage: Arc<dyn KeyValueStorage>) -> Result<Self> {
        let initial = load_value(storage.as_ref(), PREFERENCES_ROOT, Value::Object(Map::new()))?;
        Ok(Self {
            storage,
            current: Signal::new(initial),
            write: Arc::new(Mutex::new(())),
        })
    }

    /// Persist `value` at `path` and publish the new preferences object.
    ///
    /// Observers run after the write lock is released, so they may write
    /// preferences themselves.
    pub fn set_preference(&self, path: &str, value: Value) -> Result<()> {
        let blob = {
            let _write = self.write.lock();
            store_value(
                self.storage.as_ref(),
                &format!("{PREFERENCES_ROOT}.{path}"),
                value,
            )?
        };
        debug!(path, "preference written");
        self.publish(&blob);
        Ok(())
    }

    /// Remove the value at `path` and publish the new preferences object.
    pub fn delete_preference(&self, path: &str) -> Result<()> {
        let blob = {
            let _write = self.write.lock();
            delete_value(self.storage.as_ref(), &format!("{PREFERENCES_ROOT}.{path}"))?
        };
        debug!(path, "preference deleted");
        self.publish(&blob);
        Ok(())
    }

    /// Current value at `path`, if set.
    pub fn preference(&self, path: &str) -> Option<Value> {
        read_path(&self.current.get_untracked(), path).cloned()
    }

    fn publish(&self, blob: &Value) {
        let preferences = read_path(blob, PREFERENCES_ROOT)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        self.current.set(preferences);
    }
}

impl Readable for Preferences {
    type Value = Value;

    fn get(&self) -> Value {
        self.current.get()
    }

    fn peek(&self) -> Value {
        self.current.get_untracked()
    }

    fn subscribe_with(&self, run: Observer<Value>, invalidate: Option<Invalidate>) -> Subscription {
        self.current.subscribe_with(run, invalidate)
    }
}

impl fmt::Debug for Preferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preferences")
            .field("current", &self.current.get_untracked())
            .finish_non_exhaustive()
    }
}
