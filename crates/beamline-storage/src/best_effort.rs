//! Best-effort run summary.
//!
//! Prints a short table for every run as it completes: the plan, scan id,
//! the hinted fields and their last values. It never fails; malformed
//! document sequences are ignored.

use beamline_core::document::Document;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub uid: String,
    pub scan_id: u64,
    pub plan_name: String,
    pub exit_status: String,
    pub num_events: u32,
    /// Last value of every primary field.
    pub last_values: BTreeMap<String, Value>,
}

impl RunSummary {
    pub fn table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Run {} (scan {}) {}: {} events, {}",
            short_uid(&self.uid),
            self.scan_id,
            self.plan_name,
            self.num_events,
            self.exit_status
        );
        let width = self.last_values.keys().map(String::len).max().unwrap_or(0);
        for (field, value) in &self.last_values {
            let _ = writeln!(out, "  {field:<width$}  {value}");
        }
        out
    }
}

fn short_uid(uid: &str) -> &str {
    uid.get(..8).unwrap_or(uid)
}

#[derive(Debug, Default)]
struct Pending {
    summary: Option<RunSummary>,
    primary: Option<String>,
}

#[derive(Debug, Default)]
pub struct BestEffortCallback {
    pending: Mutex<Pending>,
    completed: Mutex<Vec<RunSummary>>,
    quiet: bool,
}

impl BestEffortCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect without logging the table.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn ingest(&self, doc: &Document) {
        let mut pending = self.pending.lock();
        match doc {
            Document::Start(start) => {
                *pending = Pending {
                    summary: Some(RunSummary {
                        uid: start.uid.clone(),
                        scan_id: start.scan_id,
                        plan_name: start.plan_name.clone(),
                        exit_status: String::new(),
                        num_events: 0,
                        last_values: BTreeMap::new(),
                    }),
                    primary: None,
                };
            }
            Document::Descriptor(d) if d.name == "primary" => {
                pending.primary = Some(d.uid.clone());
            }
            Document::Event(event) => {
                if pending.primary.as_deref() != Some(event.descriptor_uid.as_str()) {
                    return;
                }
                if let Some(summary) = pending.summary.as_mut() {
                    summary.num_events += 1;
                    for (field, value) in &event.data {
                        summary.last_values.insert(field.clone(), value.clone());
                    }
                }
            }
            Document::Stop(stop) => {
                let Some(mut summary) = pending.summary.take() else {
                    return;
                };
                if summary.uid != stop.run_uid {
                    return;
                }
                summary.exit_status = stop.exit_status.clone();
                if !self.quiet {
                    info!("\n{}", summary.table());
                }
                self.completed.lock().push(summary);
            }
            Document::Descriptor(_) => {}
        }
    }

    pub fn last(&self) -> Option<RunSummary> {
        self.completed.lock().last().cloned()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        self.completed.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_core::document::{DescriptorDoc, EventDoc, StartDoc, StopDoc};

    #[test]
    fn summary_tracks_primary_stream_only() {
        let bec = BestEffortCallback::quiet();
        let start = StartDoc::new("line_scan", "LineScan");
        let primary = DescriptorDoc::new(&start.uid, "primary");
        let baseline = DescriptorDoc::new(&start.uid, "baseline");
        bec.ingest(&Document::Start(start.clone()));
        bec.ingest(&Document::Descriptor(baseline.clone()));
        bec.ingest(&Document::Descriptor(primary.clone()));
        bec.ingest(&Document::Event(EventDoc::new(&start.uid, &baseline.uid, 1).with_datum("m1", 0.0)));
        for (i, v) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            bec.ingest(&Document::Event(
                EventDoc::new(&start.uid, &primary.uid, i as u32 + 1).with_datum("I0", v),
            ));
        }
        bec.ingest(&Document::Stop(StopDoc::success(&start.uid, BTreeMap::new())));

        let summary = bec.last().unwrap();
        assert_eq!(summary.num_events, 3);
        assert_eq!(summary.last_values["I0"], serde_json::json!(3.0));
        assert!(!summary.last_values.contains_key("m1"));
        assert_eq!(summary.exit_status, "success");
        assert!(summary.table().contains("LineScan"));
    }
}
