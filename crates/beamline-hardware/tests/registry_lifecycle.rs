//! Registry lifecycle against a devices file on disk.

use beamline_core::control::{ControlContext, ControlTimeouts};
use beamline_core::error::BeamlineError;
use beamline_hardware::devices::{EpicsMotor, KohzuDcm};
use beamline_hardware::{DevicesFile, DeviceRegistry, FactoryTable, SoftIoc};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const DEVICES: &str = r#"
[[devices]]
type = "motors"
prefix = "gp:m{}"
names = "m{}"
first = 1
last = 3
class = "EpicsMotor_SREV"

[[devices]]
type = "kohzu_dcm"
name = "dcm"
prefix = "gp:"
m_th = "m45"
m_y = "m46"
m_z = "m47"

[[devices]]
type = "signal"
name = "scan_id_epics"
pv = "gp:gp:int20"
value_kind = "long"
"#;

fn load(ioc: Arc<SoftIoc>) -> (ControlContext, DeviceRegistry) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(DEVICES.as_bytes()).unwrap();
    let devices = DevicesFile::load(file.path()).unwrap();
    let ctx = ControlContext::configure(ioc, ControlTimeouts::default());
    let registry = DeviceRegistry::new();
    devices
        .build_into(&ctx, &FactoryTable::with_builtin(), &registry)
        .unwrap();
    (ctx, registry)
}

#[test]
fn lookup_by_name_label_and_type() {
    let (_, registry) = load(Arc::new(SoftIoc::new()));
    assert_eq!(registry.len(), 5);

    let motors: Vec<_> = registry.findall("motor").map(|d| d.name().to_string()).collect();
    assert_eq!(motors, ["m1", "m2", "m3"]);

    assert!(registry.find_as::<EpicsMotor>("m2").unwrap().has_srev());
    assert_eq!(registry.find("monochromator").unwrap().name(), "dcm");
    assert!(registry.find_as::<KohzuDcm>("m1").is_err());

    assert!(matches!(registry.find("sixc"), Err(BeamlineError::Lookup(_))));
    assert!(registry.find_optional("sixc").is_none());
    assert!(matches!(
        registry.find("motor"),
        Err(BeamlineError::Ambiguous { count: 3, .. })
    ));
}

#[test]
fn duplicate_registration_leaves_registry_unchanged() {
    let (ctx, registry) = load(Arc::new(SoftIoc::new()));
    let before = registry.names();
    let err = registry
        .register(Arc::new(EpicsMotor::new(&ctx, "gp:m99", "m1")), ["motor"])
        .unwrap_err();
    assert!(matches!(err, BeamlineError::DuplicateName(_)));
    assert_eq!(registry.names(), before);
    assert_eq!(registry.find_as::<EpicsMotor>("m1").unwrap().prefix(), "gp:m1");
}

#[tokio::test]
async fn connection_wait_times_out_on_missing_pvs() {
    let ioc = Arc::new(SoftIoc::strict());
    let (_, registry) = load(ioc.clone());
    let dcm = registry.find("dcm").unwrap();
    let err = dcm
        .wait_for_connection(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, BeamlineError::ConnectionTimeout { .. }));

    ioc.insert("gp:gp:int20", 7);
    let scan_id = registry.find("scan_id_epics").unwrap();
    scan_id
        .wait_for_connection(Some(Duration::from_millis(100)))
        .await
        .unwrap();
}
