//! Instrument configuration ("iconfig").
//!
//! Loaded once at startup with `figment`, in three layers:
//! 1. Built-in defaults from `Settings::default()`
//! 2. The iconfig TOML file (optional, warns if missing)
//! 3. Environment variables prefixed with `BEAMLINE_`, nested keys split on `__`
//!    (e.g. `BEAMLINE_RUN_ENGINE__USE_PROGRESS_BAR=false`)
//!
//! Relative paths (`devices_file`, `catalog.root`, `run_engine.md_path`) are
//! taken relative to the directory of the iconfig file, so the instrument
//! behaves the same from any working directory.
//!
//! ## Schema
//!
//! ```toml
//! instrument_name = "sim_4id"
//! beamline_id = "4-ID"
//! devices_file = "devices.toml"
//!
//! [catalog]
//! name = "training"          # "temp" (default) selects a session catalog
//! root = "catalogs"
//!
//! [run_engine]
//! md_storage_handler = "StoredDict"   # or "PersistentDict"
//! md_path = ".re_md_dict.yml"
//! use_progress_bar = true
//! scan_id_pv = "gp:gp:int20"          # optional
//! baseline_label = "baseline"
//! monitors = []
//! [run_engine.default_metadata]
//! proposal_id = "commissioning"
//!
//! [area_detector]
//! hdf5_file_template = "%s%s_%4.4d.h5"
//! allow_plugin_warmup = true
//!
//! [control]
//! connection = 5.0     # seconds; omit for unbounded waits
//! read = 5.0
//! write = 5.0
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::control::ControlTimeouts;
use crate::error::{AppResult, BeamlineError};

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "BEAMLINE_";

/// Name of the session-scoped catalog.
pub const TEMP_CATALOG: &str = "temp";

/// Top-level instrument configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minimum log level ("error", "warn", "info", "debug", "trace").
    pub log_level: String,
    pub instrument_name: String,
    pub beamline_id: String,
    /// TOML file describing the devices to construct.
    pub devices_file: Option<PathBuf>,
    pub catalog: CatalogSettings,
    pub run_engine: RunEngineSettings,
    pub area_detector: AreaDetectorSettings,
    pub control: ControlTimeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            instrument_name: "beamline".to_string(),
            beamline_id: "sim".to_string(),
            devices_file: None,
            catalog: CatalogSettings::default(),
            run_engine: RunEngineSettings::default(),
            area_detector: AreaDetectorSettings::default(),
            control: ControlTimeouts::default(),
        }
    }
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Catalog to resolve. Absent or `"temp"` selects a session catalog.
    pub name: Option<String>,
    /// Directory that holds named catalogs.
    pub root: PathBuf,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            name: Some(TEMP_CATALOG.to_string()),
            root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("beamline")
                .join("catalogs"),
        }
    }
}

/// Backing store for the run metadata dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdStorageHandler {
    /// Single YAML file.
    StoredDict,
    /// Directory with one JSON document per key.
    PersistentDict,
}

impl std::fmt::Display for MdStorageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MdStorageHandler::StoredDict => write!(f, "StoredDict"),
            MdStorageHandler::PersistentDict => write!(f, "PersistentDict"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunEngineSettings {
    pub md_storage_handler: MdStorageHandler,
    /// File (StoredDict) or directory (PersistentDict) for run metadata.
    pub md_path: PathBuf,
    /// Merged into run metadata after the programmatic fields.
    pub default_metadata: BTreeMap<String, Value>,
    pub use_progress_bar: bool,
    /// PV kept in sync with the engine's scan id.
    pub scan_id_pv: Option<String>,
    /// Devices with this label are read at the start and end of every run.
    pub baseline_label: String,
    /// Devices read after every primary event.
    pub monitors: Vec<String>,
}

impl Default for RunEngineSettings {
    fn default() -> Self {
        Self {
            md_storage_handler: MdStorageHandler::StoredDict,
            md_path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
                .join("beamline")
                .join("re_md_dict.yml"),
            default_metadata: BTreeMap::new(),
            use_progress_bar: true,
            scan_id_pv: None,
            baseline_label: "baseline".to_string(),
            monitors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaDetectorSettings {
    pub hdf5_file_template: String,
    pub allow_plugin_warmup: bool,
}

impl Default for AreaDetectorSettings {
    fn default() -> Self {
        Self {
            hdf5_file_template: "%s%s_%4.4d.h5".to_string(),
            allow_plugin_warmup: true,
        }
    }
}

impl Settings {
    /// Load layered configuration. A missing file is not an error.
    pub fn load(config_path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Settings::default());

        if let Some(path) = config_path {
            if path.exists() {
                debug!(path = %path.display(), "Loading iconfig");
                figment = figment.merge(Toml::file(path));
            } else {
                warn!(path = %path.display(), "Config file not found, using defaults");
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut settings: Settings = figment.extract()?;
        settings.validate()?;
        if let Some(dir) = config_path.filter(|p| p.exists()).and_then(Path::parent) {
            settings.resolve_relative_to(dir);
        }
        Ok(settings)
    }

    /// Anchor every relative path setting at `dir`.
    pub fn resolve_relative_to(&mut self, dir: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        };
        if let Some(devices) = self.devices_file.as_mut() {
            anchor(devices);
        }
        anchor(&mut self.catalog.root);
        anchor(&mut self.run_engine.md_path);
    }

    /// Parse configuration from a TOML string over the defaults (no env layer).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Settings::default())
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(BeamlineError::Configuration(format!(
                "log_level '{}' must be one of {:?}",
                self.log_level, LEVELS
            )));
        }
        if self.run_engine.md_path.as_os_str().is_empty() {
            return Err(BeamlineError::Configuration(
                "run_engine.md_path must not be empty".into(),
            ));
        }
        if self.area_detector.hdf5_file_template.is_empty() {
            return Err(BeamlineError::Configuration(
                "area_detector.hdf5_file_template must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Catalog name to resolve, if a named catalog was configured.
    pub fn catalog_name(&self) -> Option<&str> {
        self.catalog
            .name
            .as_deref()
            .filter(|n| !n.is_empty() && *n != TEMP_CATALOG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    #[serial]
    fn defaults_are_valid() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.run_engine.md_storage_handler, MdStorageHandler::StoredDict);
        assert!(settings.run_engine.use_progress_bar);
        assert_eq!(settings.catalog_name(), None);
        assert_eq!(settings.control.connection, Some(Duration::from_secs(5)));
    }

    #[test]
    #[serial]
    fn file_layer_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
instrument_name = "sim_4id"

[catalog]
name = "training"

[run_engine]
md_storage_handler = "PersistentDict"
use_progress_bar = false

[run_engine.default_metadata]
proposal_id = "commissioning"

[area_detector]
hdf5_file_template = "%s%s_%5.5d.h5"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.instrument_name, "sim_4id");
        assert_eq!(settings.catalog_name(), Some("training"));
        assert_eq!(
            settings.run_engine.md_storage_handler,
            MdStorageHandler::PersistentDict
        );
        assert!(!settings.run_engine.use_progress_bar);
        assert_eq!(
            settings.run_engine.default_metadata["proposal_id"],
            Value::String("commissioning".into())
        );
        assert_eq!(settings.area_detector.hdf5_file_template, "%s%s_%5.5d.h5");
    }

    #[test]
    #[serial]
    fn relative_paths_follow_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iconfig.toml");
        std::fs::write(
            &path,
            r#"
devices_file = "devices.toml"

[catalog]
root = "catalogs"

[run_engine]
md_path = "/var/lib/beamline/md.yml"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.devices_file, Some(dir.path().join("devices.toml")));
        assert_eq!(settings.catalog.root, dir.path().join("catalogs"));
        assert_eq!(settings.run_engine.md_path, PathBuf::from("/var/lib/beamline/md.yml"));
    }

    #[test]
    #[serial]
    fn env_layer_overrides_file() {
        std::env::set_var("BEAMLINE_RUN_ENGINE__USE_PROGRESS_BAR", "false");
        let settings = Settings::load(None);
        std::env::remove_var("BEAMLINE_RUN_ENGINE__USE_PROGRESS_BAR");
        assert!(!settings.unwrap().run_engine.use_progress_bar);
    }

    #[test]
    fn unknown_handler_is_rejected() {
        let err = Settings::from_toml_str("[run_engine]\nmd_storage_handler = \"Pickle\"\n")
            .unwrap_err();
        assert!(matches!(err, BeamlineError::Configuration(_)));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        assert!(Settings::from_toml_str("log_level = \"loud\"\n").is_err());
    }
}
