//! The shipped configuration files stay loadable.

use beamline_core::control::{ControlContext, ControlTimeouts};
use beamline_core::settings::Settings;
use beamline_hardware::devices::Diffractometer;
use beamline_hardware::{DeviceRegistry, DevicesFile, FactoryTable, SoftIoc};
use std::sync::Arc;

const ICONFIG: &str = include_str!("../../../config/iconfig.toml");
const DEVICES: &str = include_str!("../../../config/devices.toml");

#[test]
fn sample_iconfig_parses() {
    let settings = Settings::from_toml_str(ICONFIG).unwrap();
    assert_eq!(settings.instrument_name, "sim_4id");
    assert_eq!(settings.catalog_name(), Some("training"));
    assert!(settings.devices_file.is_some());
}

#[test]
fn sample_devices_build() {
    let file = DevicesFile::from_toml_str(DEVICES).unwrap();
    let table = FactoryTable::with_builtin();
    file.validate(&table).unwrap();

    let ctx = ControlContext::configure(Arc::new(SoftIoc::new()), ControlTimeouts::default());
    let registry = DeviceRegistry::new();
    let count = file.build_into(&ctx, &table, &registry).unwrap();
    assert_eq!(count, 30);
    assert_eq!(registry.findall("motor").count(), 16);
    for name in ["scan_id_epics", "user_calcs", "scaler1", "dcm", "shutter", "temperature", "adsimdet"] {
        assert!(registry.contains(name), "{name} missing");
    }

    let fourc = registry.find_as::<Diffractometer>("fourc").unwrap();
    for (axis, motor) in [("tth", "gp:m29"), ("omega", "gp:m30"), ("chi", "gp:m31"), ("phi", "gp:m32")] {
        assert_eq!(fourc.axis(axis).unwrap().prefix(), motor, "{axis}");
    }
}
