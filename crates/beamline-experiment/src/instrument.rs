//! Session startup: catalog, RunEngine and devices.
//!
//! [`Instrument::init`] builds exactly one RunEngine and applies, in order:
//!
//! 1. restore (or create) the run metadata dictionary; storage errors fall
//!    back to an in-memory dictionary
//! 2. merge programmatic metadata, then the configured defaults
//! 3. subscribe the catalog and the run summary collector
//! 4. install baseline and monitor collection
//! 5. configure control timeouts and construct the devices
//! 6. bind the scan-id PV, when configured
//! 7. install the progress reporter, when configured

use anyhow::Context;
use beamline_core::control::{ChannelAccess, ControlContext};
use beamline_core::settings::Settings;
use beamline_core::signal::Signal;
use beamline_hardware::{DeviceRegistry, DevicesFile, FactoryTable, Namespace, NamespaceEntry};
use beamline_storage::{session_metadata, BestEffortCallback, Catalog, Metadata, RunMetadata};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::run_engine::{LogProgress, RunEngine, SupplementalData};

/// Everything an operator session works with.
pub struct Instrument {
    pub settings: Arc<Settings>,
    pub control: ControlContext,
    pub registry: Arc<DeviceRegistry>,
    pub namespace: Arc<Namespace>,
    pub catalog: Arc<Catalog>,
    pub summaries: Arc<BestEffortCallback>,
    pub engine: Arc<RunEngine>,
}

impl Instrument {
    /// Start a session with the devices named in `settings.devices_file`
    /// (none when unset).
    pub fn load(
        settings: Settings,
        access: Arc<dyn ChannelAccess>,
        programmatic: Metadata,
    ) -> anyhow::Result<Self> {
        let devices = match &settings.devices_file {
            Some(path) => DevicesFile::load(path)?,
            None => DevicesFile::default(),
        };
        Self::init(settings, access, &devices, programmatic)
    }

    #[instrument(skip_all, fields(instrument = %settings.instrument_name), err)]
    pub fn init(
        settings: Settings,
        access: Arc<dyn ChannelAccess>,
        devices: &DevicesFile,
        programmatic: Metadata,
    ) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let catalog = Arc::new(Catalog::resolve(&settings.catalog));
        let registry = Arc::new(DeviceRegistry::new());
        let namespace = Arc::new(Namespace::new());

        let md = RunMetadata::open_or_memory(
            settings.run_engine.md_storage_handler,
            &settings.run_engine.md_path,
        );
        let engine = RunEngine::new(registry.clone())
            .with_namespace(namespace.clone())
            .with_settings(settings.clone())
            .with_catalog(catalog.clone())
            .with_metadata(md);

        let mut session = session_metadata(&settings, catalog.name());
        session.extend(programmatic);
        engine.update_metadata(session, &settings.run_engine.default_metadata);

        let sink = catalog.clone();
        engine.subscribe_callback("catalog", move |doc| Ok(sink.ingest(doc)?));
        let summaries = Arc::new(BestEffortCallback::new());
        let bec = summaries.clone();
        engine.subscribe_callback("best_effort", move |doc| {
            bec.ingest(doc);
            Ok(())
        });

        engine.set_supplemental(SupplementalData {
            baseline_label: Some(settings.run_engine.baseline_label.clone())
                .filter(|label| !label.is_empty()),
            monitors: settings.run_engine.monitors.clone(),
        });

        let control = ControlContext::configure(access, settings.control);
        let count = devices
            .build_into(&control, &FactoryTable::with_builtin(), &registry)
            .context("constructing devices")?;
        for name in registry.names() {
            if let Some(device) = registry.find_optional(&name) {
                namespace.insert(name, NamespaceEntry::Device(device));
            }
        }

        if let Some(pv) = &settings.run_engine.scan_id_pv {
            engine.bind_scan_id_signal(Signal::rw(&control, "scan_id_pv", pv.as_str()).long());
        }

        if settings.run_engine.use_progress_bar {
            engine.set_progress_reporter(Arc::new(LogProgress));
        }

        info!(
            devices = count,
            catalog = %catalog.name(),
            runs = catalog.len(),
            persistent_md = engine.metadata_is_persistent(),
            "Instrument ready"
        );

        Ok(Self {
            settings,
            control,
            registry,
            namespace,
            catalog,
            summaries,
            engine: Arc::new(engine),
        })
    }
}
