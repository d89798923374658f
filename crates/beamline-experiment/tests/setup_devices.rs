//! End-to-end provisioning of a simulated beamline.

use beamline_core::settings::Settings;
use beamline_core::PvValue;
use beamline_experiment::setup::{setup_devices, SetupAreaDetectors, SetupScaler1, DEFAULT_SREV};
use beamline_experiment::plans::Count;
use beamline_experiment::simulation::ad_setup;
use beamline_experiment::Instrument;
use beamline_hardware::devices::Diffractometer;
use beamline_hardware::{DevicesFile, SoftIoc};
use beamline_storage::Metadata;
use std::path::Path;
use std::sync::Arc;

const DEVICES: &str = r#"
[[devices]]
type = "motors"
prefix = "gp:m"
first = 1
last = 4
class = "EpicsMotor_SREV"
labels = ["motor", "baseline"]

[[devices]]
type = "signal"
name = "scan_id_epics"
pv = "gp:gp:int20"
value_kind = "long"

[[devices]]
type = "user_calcs"
prefix = "gp:"

[[devices]]
type = "user_calcouts"
prefix = "gp:"

[[devices]]
type = "user_sseqs"
prefix = "gp:"

[[devices]]
type = "user_transforms"
prefix = "gp:"

[[devices]]
type = "scaler"
name = "scaler1"
prefix = "vsc:scaler1"

[[devices]]
type = "kohzu_dcm"
name = "dcm"
prefix = "gp:"
m_th = "m45"
m_y = "m46"
m_z = "m47"

[[devices]]
type = "four_circle"
name = "fourc"
prefix = "gp:"
m_tth = "m29"
m_th = "m30"
m_chi = "m31"
m_phi = "m32"

[[devices]]
type = "sim_shutter"
name = "shutter"

[[devices]]
type = "temperature"
name = "temperature"
prefix = "gp:userCalc8"

[[devices]]
type = "ad_sim_detector"
name = "adsimdet"
prefix = "ad:"

[[devices]]
type = "transform"
name = "ad_transform"
prefix = "gp:userTran10"
"#;

const AREA_DETECTOR_ONLY: &str = r#"
[[devices]]
type = "ad_sim_detector"
name = "adsimdet"
prefix = "ad:"

[[devices]]
type = "transform"
name = "ad_transform"
prefix = "gp:userTran10"
"#;

fn settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.catalog.root = dir.join("catalogs");
    settings.run_engine.md_path = dir.join("md.yml");
    settings.run_engine.use_progress_bar = false;
    settings
}

fn beamline_ioc() -> Arc<SoftIoc> {
    let ioc = Arc::new(SoftIoc::new());
    for axis in ["gp:m45", "gp:m46", "gp:m47"] {
        ioc.insert(format!("{axis}.RBV"), 0.0);
    }
    ioc.insert("gp:BraggERdbkAO", 8.0);
    ioc.insert("gp:BraggERdbkAO.EGU", "keV");
    ioc.insert("ad:cam1:MaxSizeX_RBV", 1024i64);
    ioc.insert("ad:cam1:MaxSizeY_RBV", 1024i64);
    ioc
}

fn instrument(dir: &Path, ioc: Arc<SoftIoc>, devices: &str) -> Instrument {
    Instrument::init(
        settings(dir),
        ioc,
        &DevicesFile::from_toml_str(devices).unwrap(),
        Metadata::new(),
    )
    .unwrap()
}

fn as_f64(ioc: &SoftIoc, pv: &str) -> f64 {
    ioc.value(pv).and_then(|v| v.as_f64()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn setup_devices_provisions_the_beamline() {
    let dir = tempfile::tempdir().unwrap();
    let ioc = beamline_ioc();
    let instrument = instrument(dir.path(), ioc.clone(), DEVICES);

    let result = instrument.engine.run(Box::new(setup_devices())).await.unwrap();
    assert!(result.is_success(), "{:?}", result.reason);

    let steps: Vec<_> = result
        .checkpoints
        .iter()
        .filter(|label| label.starts_with("setup_") || label.ends_with("user_calcs") || label.starts_with("change_"))
        .filter(|label| label.as_str() != "change_ad_simulated_image_parameters")
        .map(String::as_str)
        .collect();
    assert_eq!(
        steps,
        [
            "setup_scan_id",
            "enable_user_calcs",
            "change_motor_srev",
            "setup_scaler1",
            "change_noisy_signal_parameters",
            "setup_shutter",
            "setup_monochromator",
            "setup_diffractometers",
            "setup_temperature_positioner",
            "setup_area_detectors",
        ]
    );

    // scan_id follows the (empty) temporary catalog
    assert_eq!(as_f64(&ioc, "gp:gp:int20"), 0.0);
    assert_eq!(as_f64(&ioc, "gp:userCalcEnable"), 1.0);
    for motor in 1..=4 {
        assert_eq!(as_f64(&ioc, &format!("gp:m{motor}.SREV")), DEFAULT_SREV as f64);
    }

    for (number, expected) in ["timebase", "I0", "scint", "diode", "I000", "I00"].iter().enumerate() {
        let pv = format!("vsc:scaler1.NM{}", number + 1);
        assert_eq!(ioc.value(&pv).map(|v| v.to_string()).as_deref(), Some(*expected));
        assert!(instrument.registry.contains(expected));
        assert!(instrument.namespace.signal(expected).is_some());
    }
    assert!(instrument.registry.labels_of("I0").unwrap().contains("counter"));

    assert_eq!(as_f64(&ioc, "gp:m45.RBV"), 2.0);
    assert_eq!(as_f64(&ioc, "gp:m46.RBV"), -5.0);
    assert_eq!(as_f64(&ioc, "gp:m47.RBV"), 5.0);
    assert_eq!(ioc.puts_to("gp:KohzuOperAckBO"), [PvValue::Long(1)]);

    let fourc = instrument.registry.find_as::<Diffractometer>("fourc").unwrap();
    assert_eq!(fourc.axis("tth").unwrap().prefix(), "gp:m29");
    assert_eq!(fourc.axis("omega").unwrap().prefix(), "gp:m30");
    assert_eq!(fourc.axis("chi").unwrap().prefix(), "gp:m31");
    assert_eq!(fourc.axis("phi").unwrap().prefix(), "gp:m32");
    let calc = fourc.calc_energy();
    assert_eq!(calc.energy_kev, 8.0);
    assert!((calc.wavelength_angstrom - 1.549_802).abs() < 1e-5);

    assert_eq!(result.num_events["baseline"], 2);
    assert_eq!(instrument.catalog.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scaler_names_assigned_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let ioc = beamline_ioc();
    let instrument = instrument(dir.path(), ioc.clone(), DEVICES);

    for _ in 0..2 {
        let result = instrument.engine.run(Box::new(SetupScaler1::new())).await.unwrap();
        assert!(result.is_success());
    }
    assert_eq!(ioc.puts_to("vsc:scaler1.NM1"), [PvValue::from("timebase")]);
    assert!(instrument.registry.contains("scint"));
}

#[tokio::test(flavor = "multi_thread")]
async fn dithering_failure_does_not_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let ioc = beamline_ioc();
    // no user_calcs: the dithering step cannot find its calc records
    let instrument = instrument(dir.path(), ioc.clone(), AREA_DETECTOR_ONLY);

    let result = instrument
        .engine
        .run(Box::new(SetupAreaDetectors::new().with_seed(5)))
        .await
        .unwrap();
    assert!(result.is_success(), "{:?}", result.reason);
    assert!(ioc.puts_to("gp:userCalc9.CALC").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_scan_id_signal_fails_setup() {
    let dir = tempfile::tempdir().unwrap();
    let instrument = instrument(dir.path(), beamline_ioc(), AREA_DETECTOR_ONLY);

    let result = instrument.engine.run(Box::new(setup_devices())).await.unwrap();
    assert!(!result.is_success());
    assert!(result.reason.contains("scan_id_epics"), "{}", result.reason);
}

#[tokio::test(flavor = "multi_thread")]
async fn count_stages_and_unstages_the_area_detector() {
    let dir = tempfile::tempdir().unwrap();
    let ioc = beamline_ioc();
    let instrument = instrument(dir.path(), ioc.clone(), AREA_DETECTOR_ONLY);

    let result = instrument.engine.run(Box::new(ad_setup("adsimdet"))).await.unwrap();
    assert!(result.is_success(), "{:?}", result.reason);
    assert!(ioc.puts_to("ad:HDF1:Compression").is_empty());

    let result = instrument
        .engine
        .run(Box::new(Count::new(1).with_detector("adsimdet")))
        .await
        .unwrap();
    assert!(result.is_success(), "{:?}", result.reason);

    let compression = ioc.puts_to("ad:HDF1:Compression");
    assert_eq!(compression.first(), Some(&PvValue::from("zlib")));
    assert_eq!(compression.len(), 2);
    assert_eq!(ioc.puts_to("ad:cam1:WaitForPlugins").first(), Some(&PvValue::from("Yes")));
    assert_eq!(ioc.puts_to("ad:image1:BlockingCallbacks").first(), Some(&PvValue::from("No")));
    // capture on while staged, restored afterwards
    assert_eq!(ioc.puts_to("ad:HDF1:Capture").first(), Some(&PvValue::Long(1)));
    assert_eq!(ioc.puts_to("ad:HDF1:Capture").len(), 2);
}
