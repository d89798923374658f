//! Run metadata dictionary with interchangeable persistent backends.
//!
//! | Handler          | Layout                                   |
//! |------------------|------------------------------------------|
//! | `StoredDict`     | one YAML file with every key             |
//! | `PersistentDict` | directory, one JSON document per key     |
//!
//! Every mutation is written through to the attached store. If a write
//! fails, the dictionary detaches the store, logs a warning and carries on
//! in memory.

use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::settings::{MdStorageHandler, Settings};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub type Metadata = BTreeMap<String, Value>;

/// Backing store for [`RunMetadata`].
pub trait MetadataStore: Send + Sync + fmt::Debug {
    fn load(&self) -> AppResult<Metadata>;
    fn save(&self, entries: &Metadata) -> AppResult<()>;
    /// Location, for log messages.
    fn location(&self) -> &Path;
}

fn storage_err(path: &Path, e: impl fmt::Display) -> BeamlineError {
    BeamlineError::Storage(format!("{}: {e}", path.display()))
}

// =============================================================================
// StoredDict
// =============================================================================

/// Whole dictionary in one YAML file.
#[derive(Debug)]
pub struct StoredDict {
    path: PathBuf,
}

impl StoredDict {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetadataStore for StoredDict {
    fn load(&self) -> AppResult<Metadata> {
        if !self.path.exists() {
            return Ok(Metadata::new());
        }
        let text = fs::read_to_string(&self.path).map_err(|e| storage_err(&self.path, e))?;
        if text.trim().is_empty() {
            return Ok(Metadata::new());
        }
        serde_yaml::from_str(&text).map_err(|e| storage_err(&self.path, e))
    }

    fn save(&self, entries: &Metadata) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| storage_err(parent, e))?;
        }
        let text = serde_yaml::to_string(entries).map_err(|e| storage_err(&self.path, e))?;
        fs::write(&self.path, text).map_err(|e| storage_err(&self.path, e))
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

// =============================================================================
// PersistentDict
// =============================================================================

#[derive(Serialize, Deserialize)]
struct KeyDocument {
    key: String,
    value: Value,
}

/// One JSON document per key in a directory.
#[derive(Debug)]
pub struct PersistentDict {
    dir: PathBuf,
}

impl PersistentDict {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        // distinct keys can sanitize to the same stem
        let tag = key.bytes().fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
        self.dir.join(format!("{stem}.{tag:08x}.json"))
    }
}

impl MetadataStore for PersistentDict {
    fn load(&self) -> AppResult<Metadata> {
        let mut entries = Metadata::new();
        if !self.dir.exists() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.dir).map_err(|e| storage_err(&self.dir, e))? {
            let path = entry.map_err(|e| storage_err(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|e| storage_err(&path, e))?;
            let doc: KeyDocument = serde_json::from_str(&text).map_err(|e| storage_err(&path, e))?;
            entries.insert(doc.key, doc.value);
        }
        Ok(entries)
    }

    fn save(&self, entries: &Metadata) -> AppResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| storage_err(&self.dir, e))?;
        let mut keep = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let path = self.file_for(key);
            let doc = KeyDocument {
                key: key.clone(),
                value: value.clone(),
            };
            let text = serde_json::to_string_pretty(&doc).map_err(|e| storage_err(&path, e))?;
            fs::write(&path, text).map_err(|e| storage_err(&path, e))?;
            keep.push(path);
        }
        for entry in fs::read_dir(&self.dir).map_err(|e| storage_err(&self.dir, e))? {
            let path = entry.map_err(|e| storage_err(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") && !keep.contains(&path) {
                fs::remove_file(&path).map_err(|e| storage_err(&path, e))?;
            }
        }
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.dir
    }
}

// =============================================================================
// RunMetadata
// =============================================================================

/// Session metadata merged into every run's start document.
#[derive(Debug, Default)]
pub struct RunMetadata {
    entries: Metadata,
    store: Option<Box<dyn MetadataStore>>,
}

impl RunMetadata {
    /// Dictionary without persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Restore from (or create) the store selected by `handler`.
    pub fn open(handler: MdStorageHandler, path: &Path) -> AppResult<Self> {
        let store: Box<dyn MetadataStore> = match handler {
            MdStorageHandler::StoredDict => Box::new(StoredDict::new(path)),
            MdStorageHandler::PersistentDict => Box::new(PersistentDict::new(path)),
        };
        Self::with_store(store)
    }

    pub fn with_store(store: Box<dyn MetadataStore>) -> AppResult<Self> {
        let entries = store.load()?;
        store.save(&entries)?;
        info!(
            location = %store.location().display(),
            keys = entries.len(),
            "Run metadata restored"
        );
        Ok(Self {
            entries,
            store: Some(store),
        })
    }

    /// [`RunMetadata::open`], falling back to memory on any storage error.
    pub fn open_or_memory(handler: MdStorageHandler, path: &Path) -> Self {
        match Self::open(handler, path) {
            Ok(md) => md,
            Err(e) => {
                warn!(
                    handler = %handler,
                    path = %path.display(),
                    error = %e,
                    "Run metadata is not persistent"
                );
                Self::in_memory()
            }
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &Metadata {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
        self.persist();
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Merge `fields`; later values win on key collision.
    pub fn update<I, K>(&mut self, fields: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (key, value) in fields {
            self.entries.insert(key.into(), value);
        }
        self.persist();
    }

    pub fn scan_id(&self) -> u64 {
        self.entries.get("scan_id").and_then(Value::as_u64).unwrap_or(0)
    }

    /// Increment `scan_id` and return the new value.
    pub fn next_scan_id(&mut self) -> u64 {
        let next = self.scan_id() + 1;
        self.insert("scan_id", next);
        next
    }

    fn persist(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.entries) {
            warn!(
                location = %store.location().display(),
                error = %e,
                "Run metadata write failed, continuing without persistence"
            );
            self.store = None;
        } else {
            debug!(keys = self.entries.len(), "Run metadata saved");
        }
    }
}

/// Merge programmatic fields, then configured defaults (defaults win).
pub fn merge_metadata(md: &mut RunMetadata, programmatic: Metadata, defaults: &Metadata) {
    md.update(programmatic);
    md.update(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Session fields every run carries.
pub fn session_metadata(settings: &Settings, catalog_name: &str) -> Metadata {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    Metadata::from([
        ("beamline_id".to_string(), json!(settings.beamline_id)),
        ("instrument_name".to_string(), json!(settings.instrument_name)),
        ("databroker_catalog".to_string(), json!(catalog_name)),
        ("login_id".to_string(), json!(format!("{user}@{host}"))),
        ("hostname".to_string(), json!(host)),
        ("pid".to_string(), json!(std::process::id())),
        (
            "md_storage_handler".to_string(),
            json!(settings.run_engine.md_storage_handler.to_string()),
        ),
        (
            "versions".to_string(),
            json!({ "beamline": env!("CARGO_PKG_VERSION") }),
        ),
        (
            "session_started".to_string(),
            json!(chrono::Local::now().to_rfc3339()),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_defaults_win_on_collision() {
        let mut md = RunMetadata::in_memory();
        let defaults = Metadata::from([("a".to_string(), json!(2)), ("b".to_string(), json!(3))]);
        merge_metadata(&mut md, Metadata::from([("a".to_string(), json!(1))]), &defaults);
        assert_eq!(md.entries(), &defaults);
    }

    #[test]
    fn stored_dict_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("re_md_dict.yml");
        {
            let mut md = RunMetadata::open(MdStorageHandler::StoredDict, &path).unwrap();
            md.insert("sample", "Si(111)");
            assert_eq!(md.next_scan_id(), 1);
            assert_eq!(md.next_scan_id(), 2);
        }
        let md = RunMetadata::open(MdStorageHandler::StoredDict, &path).unwrap();
        assert_eq!(md.scan_id(), 2);
        assert_eq!(md.get("sample"), Some(&json!("Si(111)")));
    }

    #[test]
    fn persistent_dict_keeps_one_document_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("md");
        {
            let mut md = RunMetadata::open(MdStorageHandler::PersistentDict, &path).unwrap();
            md.insert("proposal/id", 12345);
            md.insert("proposal_id", "other");
            md.insert("scratch", true);
            md.remove("scratch");
        }
        assert_eq!(fs::read_dir(&path).unwrap().count(), 2);
        let md = RunMetadata::open(MdStorageHandler::PersistentDict, &path).unwrap();
        assert_eq!(md.get("proposal/id"), Some(&json!(12345)));
        assert_eq!(md.get("proposal_id"), Some(&json!("other")));
        assert!(md.get("scratch").is_none());
    }

    #[test]
    fn unusable_store_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "x").unwrap();
        let md = RunMetadata::open_or_memory(
            MdStorageHandler::StoredDict,
            &blocker.join("re_md_dict.yml"),
        );
        assert!(!md.is_persistent());
    }

    #[test]
    fn session_metadata_names_catalog() {
        let md = session_metadata(&Settings::default(), "temp");
        assert_eq!(md["databroker_catalog"], json!("temp"));
        assert!(md.contains_key("login_id"));
        assert!(md.contains_key("versions"));
    }
}
