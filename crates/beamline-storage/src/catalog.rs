//! Run catalog.
//!
//! A catalog collects completed runs. Documents are buffered per run as they
//! arrive; the run is appended as one immutable [`RunRecord`] when its Stop
//! document is ingested.
//!
//! # Backends
//!
//! - **Named**: `{root}/{name}.jsonl`, one JSON line per run. Existing runs
//!   are loaded when the catalog is opened.
//! - **Temp**: in-memory, lives for the session only.
//!
//! [`Catalog::resolve`] never fails: an absent or unreadable named catalog
//! falls back to a temp catalog with a warning.

use beamline_core::document::{DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
use beamline_core::error::{AppResult, BeamlineError};
use beamline_core::settings::{CatalogSettings, TEMP_CATALOG};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub start: StartDoc,
    pub descriptors: Vec<DescriptorDoc>,
    pub events: Vec<EventDoc>,
    pub stop: StopDoc,
}

impl RunRecord {
    pub fn uid(&self) -> &str {
        &self.start.uid
    }

    pub fn scan_id(&self) -> u64 {
        self.start.scan_id
    }

    /// Events of the named stream (`primary`, `baseline`, ...).
    pub fn stream(&self, name: &str) -> Vec<&EventDoc> {
        let Some(descriptor) = self.descriptors.iter().find(|d| d.name == name) else {
            return Vec::new();
        };
        self.events
            .iter()
            .filter(|e| e.descriptor_uid == descriptor.uid)
            .collect()
    }
}

#[derive(Debug, Default)]
struct OpenRun {
    start: Option<StartDoc>,
    descriptors: Vec<DescriptorDoc>,
    events: Vec<EventDoc>,
}

#[derive(Debug)]
enum Backend {
    Temp,
    JsonLines(PathBuf),
}

#[derive(Debug)]
pub struct Catalog {
    name: String,
    backend: Backend,
    runs: Mutex<Vec<RunRecord>>,
    open: Mutex<HashMap<String, OpenRun>>,
}

impl Catalog {
    /// Session-scoped catalog.
    pub fn temp() -> Self {
        Self {
            name: TEMP_CATALOG.to_string(),
            backend: Backend::Temp,
            runs: Mutex::new(Vec::new()),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(root: &Path, name: &str) -> PathBuf {
        root.join(format!("{name}.jsonl"))
    }

    /// Open an existing named catalog. Fails with `Lookup` if it does not exist.
    pub fn open(root: &Path, name: &str) -> AppResult<Self> {
        let path = Self::path_for(root, name);
        if !path.is_file() {
            return Err(BeamlineError::Lookup(format!("catalog '{name}'")));
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let mut runs = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let run: RunRecord = serde_json::from_str(&line).map_err(|e| {
                BeamlineError::Storage(format!("{}:{}: {e}", path.display(), number + 1))
            })?;
            runs.push(run);
        }
        debug!(catalog = name, runs = runs.len(), "Opened catalog");
        Ok(Self {
            name: name.to_string(),
            backend: Backend::JsonLines(path),
            runs: Mutex::new(runs),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Create an empty named catalog, or open it if it already exists.
    pub fn create(root: &Path, name: &str) -> AppResult<Self> {
        fs::create_dir_all(root)?;
        let path = Self::path_for(root, name);
        if !path.exists() {
            fs::File::create(&path)?;
            info!(catalog = name, path = %path.display(), "Created catalog");
        }
        Self::open(root, name)
    }

    /// Resolve the configured catalog, falling back to a temp catalog.
    pub fn resolve(settings: &CatalogSettings) -> Self {
        let name = match settings.name.as_deref().map(str::trim) {
            None | Some("") => return Self::temp(),
            Some(name) if name == TEMP_CATALOG => return Self::temp(),
            Some(name) => name,
        };
        match Self::open(&settings.root, name) {
            Ok(catalog) => {
                info!(catalog = name, runs = catalog.len(), "Using catalog");
                catalog
            }
            Err(e) => {
                warn!(catalog = name, error = %e, "Catalog unavailable, using temp catalog");
                Self::temp()
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_temp(&self) -> bool {
        matches!(self.backend, Backend::Temp)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().clone()
    }

    pub fn run(&self, uid: &str) -> Option<RunRecord> {
        self.runs.lock().iter().find(|r| r.uid() == uid).cloned()
    }

    /// Most recent run (`cat[-1]`).
    pub fn last(&self) -> Option<RunRecord> {
        self.runs.lock().last().cloned()
    }

    /// Subscription callback: buffer documents, append the run on Stop.
    pub fn ingest(&self, doc: &Document) -> AppResult<()> {
        let run_uid = doc.run_uid().to_string();
        match doc {
            Document::Start(start) => {
                self.open.lock().entry(run_uid).or_default().start = Some(start.clone());
            }
            Document::Descriptor(descriptor) => {
                self.open
                    .lock()
                    .entry(run_uid)
                    .or_default()
                    .descriptors
                    .push(descriptor.clone());
            }
            Document::Event(event) => {
                self.open
                    .lock()
                    .entry(run_uid)
                    .or_default()
                    .events
                    .push(event.clone());
            }
            Document::Stop(stop) => {
                let open = self.open.lock().remove(&run_uid).unwrap_or_default();
                let start = open.start.ok_or_else(|| {
                    BeamlineError::Storage(format!("stop document for unknown run {run_uid}"))
                })?;
                let record = RunRecord {
                    start,
                    descriptors: open.descriptors,
                    events: open.events,
                    stop: stop.clone(),
                };
                self.append(record)?;
            }
        }
        Ok(())
    }

    fn append(&self, record: RunRecord) -> AppResult<()> {
        if let Backend::JsonLines(path) = &self.backend {
            let line = serde_json::to_string(&record)
                .map_err(|e| BeamlineError::Storage(e.to_string()))?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{line}")?;
        }
        debug!(catalog = %self.name, uid = record.uid(), scan_id = record.scan_id(), "Run appended");
        self.runs.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn run_documents(scan_id: u64) -> Vec<Document> {
        let mut start = StartDoc::new("count", "Count");
        start.scan_id = scan_id;
        let descriptor = DescriptorDoc::new(&start.uid, "primary");
        let event = EventDoc::new(&start.uid, &descriptor.uid, 1).with_datum("I0", 12.0);
        let stop = StopDoc::success(&start.uid, BTreeMap::from([("primary".to_string(), 1)]));
        vec![
            Document::Start(start),
            Document::Descriptor(descriptor),
            Document::Event(event),
            Document::Stop(stop),
        ]
    }

    #[test]
    fn run_is_appended_only_on_stop() {
        let catalog = Catalog::temp();
        let docs = run_documents(1);
        for doc in &docs[..3] {
            catalog.ingest(doc).unwrap();
        }
        assert!(catalog.is_empty());
        catalog.ingest(&docs[3]).unwrap();
        assert_eq!(catalog.len(), 1);
        let run = catalog.last().unwrap();
        assert_eq!(run.stream("primary").len(), 1);
        assert!(run.stream("baseline").is_empty());
    }

    #[test]
    fn named_catalog_persists_runs() {
        let root = tempfile::tempdir().unwrap();
        let catalog = Catalog::create(root.path(), "class_2021_03").unwrap();
        for doc in run_documents(7) {
            catalog.ingest(&doc).unwrap();
        }
        let reopened = Catalog::open(root.path(), "class_2021_03").unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.last().unwrap().scan_id(), 7);
        assert!(!reopened.is_temp());
    }

    #[test]
    fn absent_catalog_falls_back_to_temp() {
        let root = tempfile::tempdir().unwrap();
        let settings = CatalogSettings {
            name: Some("no_such_catalog".to_string()),
            root: root.path().to_path_buf(),
        };
        let catalog = Catalog::resolve(&settings);
        assert!(catalog.is_temp());
        assert_eq!(catalog.name(), TEMP_CATALOG);

        let unset = CatalogSettings {
            name: None,
            root: root.path().to_path_buf(),
        };
        assert!(Catalog::resolve(&unset).is_temp());
    }

    #[test]
    fn stop_without_start_is_a_storage_error() {
        let catalog = Catalog::temp();
        let stop = StopDoc::success("nope", BTreeMap::new());
        assert!(matches!(
            catalog.ingest(&Document::Stop(stop)),
            Err(BeamlineError::Storage(_))
        ));
    }
}
