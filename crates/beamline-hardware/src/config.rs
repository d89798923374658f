//! Devices file loading.
//!
//! The devices file is a TOML list of device entries:
//!
//! ```toml
//! [[devices]]
//! type = "motors"
//! prefix = "gp:m"
//! first = 1
//! last = 56
//! labels = ["motor", "baseline"]
//!
//! [[devices]]
//! type = "kohzu_dcm"
//! name = "dcm"
//! prefix = "gp:"
//! m_th = "m45"
//! m_y = "m46"
//! m_z = "m47"
//! ```
//!
//! Loading is two-phase: every entry is validated against the
//! [`FactoryTable`] first (unknown types and missing fields are reported
//! together), then entries are built and registered in file order.

use beamline_core::control::ControlContext;
use beamline_core::error::{AppResult, BeamlineError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::factory::FactoryTable;
use crate::registry::DeviceRegistry;

/// One `[[devices]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Type-specific keys.
    #[serde(flatten)]
    pub params: toml::Table,
}

impl DeviceSpec {
    /// Short description for error messages.
    pub fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("{} '{}'", self.device_type, name),
            None => self.device_type.clone(),
        }
    }

    /// A required string field: `name`, `prefix`, or a type-specific key.
    pub fn required(&self, field: &str) -> AppResult<&str> {
        let value = match field {
            "name" => self.name.as_deref(),
            "prefix" => self.prefix.as_deref(),
            other => self.params.get(other).and_then(|v| v.as_str()),
        };
        value.filter(|v| !v.is_empty()).ok_or_else(|| {
            BeamlineError::Configuration(format!(
                "{}: must define a string value for '{field}'",
                self.describe()
            ))
        })
    }

    /// Type-specific keys deserialized into `T`.
    pub fn params<T: DeserializeOwned>(&self) -> AppResult<T> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| BeamlineError::Configuration(format!("{}: {e}", self.describe())))
    }

    /// Configured labels, or `defaults` when none are given.
    pub fn labels_or(&self, defaults: &[&str]) -> Vec<String> {
        if self.labels.is_empty() {
            defaults.iter().map(|l| l.to_string()).collect()
        } else {
            self.labels.clone()
        }
    }
}

/// Parsed devices file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevicesFile {
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

impl DevicesFile {
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BeamlineError::Configuration(format!("reading devices file {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loading devices file");
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        toml::from_str(text)
            .map_err(|e| BeamlineError::Configuration(format!("parsing devices file: {e}")))
    }

    /// Validate every entry; all problems are reported in one error.
    pub fn validate(&self, table: &FactoryTable) -> AppResult<()> {
        let mut problems = Vec::new();
        let mut names = HashSet::new();
        for (index, spec) in self.devices.iter().enumerate() {
            if let Err(e) = table.validate(spec) {
                problems.push(format!("entry {}: {e}", index + 1));
            }
            if let Some(name) = &spec.name {
                if !names.insert(name.as_str()) {
                    problems.push(format!("entry {}: duplicate name '{name}'", index + 1));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(BeamlineError::Configuration(problems.join("; ")))
        }
    }

    /// Validate, then build every entry into `registry`. Returns the number
    /// of devices registered.
    pub fn build_into(
        &self,
        ctx: &ControlContext,
        table: &FactoryTable,
        registry: &DeviceRegistry,
    ) -> AppResult<usize> {
        self.validate(table)?;
        let mut count = 0;
        for spec in &self.devices {
            for built in table.build(ctx, spec)? {
                registry.register(built.device, built.labels)?;
                count += 1;
            }
        }
        info!(count, entries = self.devices.len(), "Devices registered");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_ioc::SoftIoc;
    use beamline_core::control::ControlTimeouts;
    use std::sync::Arc;

    const FILE: &str = r#"
[[devices]]
type = "motors"
prefix = "gp:m"
first = 1
last = 4
labels = ["motor", "baseline"]

[[devices]]
type = "scaler"
name = "scaler1"
prefix = "vsc:scaler1"
"#;

    #[test]
    fn entries_keep_type_specific_keys() {
        let file = DevicesFile::from_toml_str(FILE).unwrap();
        assert_eq!(file.devices.len(), 2);
        assert_eq!(file.devices[0].params.get("last").and_then(|v| v.as_integer()), Some(4));
        assert!(file.devices[1].required("prefix").is_ok());
        assert!(file.devices[0].required("name").is_err());
    }

    #[test]
    fn build_registers_in_file_order() {
        let ctx = ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default());
        let registry = DeviceRegistry::new();
        let file = DevicesFile::from_toml_str(FILE).unwrap();
        let count = file
            .build_into(&ctx, &FactoryTable::with_builtin(), &registry)
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(registry.names(), ["m1", "m2", "m3", "m4", "scaler1"]);
        assert_eq!(registry.findall("baseline").count(), 4);
    }

    #[test]
    fn validation_reports_every_bad_entry() {
        let file = DevicesFile::from_toml_str(
            r#"
[[devices]]
type = "warp_drive"
name = "w"

[[devices]]
type = "motor"
name = "m1"
"#,
        )
        .unwrap();
        let err = file.validate(&FactoryTable::with_builtin()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("entry 1"));
        assert!(message.contains("entry 2"));
    }
}
