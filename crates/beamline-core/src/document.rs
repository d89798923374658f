//! Run documents emitted by the RunEngine.
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per stream: "primary", "baseline", monitors)
//!    │       │
//!    │       └── EventDoc (N)
//!    │
//! StopDoc (1)
//! ```
//!
//! Subscribers (catalog ingest, summary collector) receive every document in
//! this order. A catalog appends a run once it has seen the Stop document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Document types for run data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Event(EventDoc),
    Stop(StopDoc),
}

impl Document {
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid, // Start doc UID is the run UID
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
        }
    }
}

/// Start document - emitted at the beginning of a run
///
/// `metadata` is the engine's run metadata dictionary at run start (including
/// the incremented `scan_id`) merged with per-run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    pub scan_id: u64,
    pub plan_type: String,
    pub plan_name: String,
    pub plan_args: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, Value>,
    /// Visualization hints (preferred plot axes)
    pub hints: Vec<String>,
    pub time_ns: u64,
}

impl StartDoc {
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            scan_id: 0,
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: BTreeMap::new(),
            metadata: BTreeMap::new(),
            hints: Vec::new(),
            time_ns: now_ns(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: &str) -> Self {
        self.plan_args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Descriptor document - defines schema for one data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name (e.g., "primary", "baseline")
    pub name: String,
    pub data_keys: BTreeMap<String, DataKey>,
    pub time_ns: u64,
}

impl DescriptorDoc {
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            time_ns: now_ns(),
        }
    }

    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// "number", "integer" or "string"
    pub dtype: String,
    /// Source device or PV
    pub source: String,
    pub units: String,
}

impl DataKey {
    pub fn new(dtype: &str, source: &str) -> Self {
        Self {
            dtype: dtype.to_string(),
            source: source.to_string(),
            units: String::new(),
        }
    }

    pub fn for_value(value: &Value, source: &str) -> Self {
        let dtype = match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            _ => "object",
        };
        Self::new(dtype, source)
    }
}

/// Event document - one reading of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    pub uid: String,
    pub run_uid: String,
    pub descriptor_uid: String,
    /// Sequence number within the descriptor's stream, starting at 1
    pub seq_num: u32,
    pub time_ns: u64,
    pub data: BTreeMap<String, Value>,
    pub timestamps: BTreeMap<String, u64>,
}

impl EventDoc {
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    pub fn with_datum(mut self, field: &str, value: impl Into<Value>) -> Self {
        let ts = now_ns();
        self.data.insert(field.to_string(), value.into());
        self.timestamps.insert(field.to_string(), ts);
        self
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    pub uid: String,
    pub run_uid: String,
    /// Exit status: "success", "abort", "fail"
    pub exit_status: String,
    /// Reason for abort/failure
    pub reason: String,
    pub time_ns: u64,
    /// Events emitted per stream
    pub num_events: BTreeMap<String, u32>,
}

impl StopDoc {
    fn with_status(run_uid: &str, status: &str, reason: &str, num_events: BTreeMap<String, u32>) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: status.to_string(),
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    pub fn success(run_uid: &str, num_events: BTreeMap<String, u32>) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    pub fn abort(run_uid: &str, reason: &str, num_events: BTreeMap<String, u32>) -> Self {
        Self::with_status(run_uid, "abort", reason, num_events)
    }

    pub fn fail(run_uid: &str, reason: &str, num_events: BTreeMap<String, u32>) -> Self {
        Self::with_status(run_uid, "fail", reason, num_events)
    }

    pub fn total_events(&self) -> u32 {
        self.num_events.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_serialize_with_type_tag() {
        let start = StartDoc::new("setup", "setup_devices").with_metadata("beamline_id", "bl");
        let doc = Document::Start(start.clone());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["metadata"]["beamline_id"], "bl");
        let back: Document = serde_json::from_value(json).unwrap();
        assert_eq!(back.run_uid(), start.uid);
    }

    #[test]
    fn data_key_dtype_follows_value() {
        assert_eq!(DataKey::for_value(&serde_json::json!(3), "s").dtype, "integer");
        assert_eq!(DataKey::for_value(&serde_json::json!(3.5), "s").dtype, "number");
        assert_eq!(DataKey::for_value(&serde_json::json!("I0"), "s").dtype, "string");
    }

    #[test]
    fn stop_totals_events_across_streams() {
        let counts = BTreeMap::from([("primary".to_string(), 3), ("baseline".to_string(), 2)]);
        assert_eq!(StopDoc::success("r", counts).total_events(), 5);
    }
}
