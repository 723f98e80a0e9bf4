use evcm::config::{AppConfig, GridConfig, config_schema};
use evcm::error::EvcmError;
use std::io::Write;

const YAML: &str = r#"
timezone: Europe/Amsterdam
storage_dir: /tmp/evcm-test
priority:
  mode_enabled: true
chargers:
  - id: garage
    name: Garage
    grid:
      mode: split
      import_power: sensor.grid_import
      export_power: sensor.grid_export
    entities:
      cable: binary_sensor.garage_cable
      charging_enable: switch.garage_enable
      current_setting: number.garage_current
      lock: lock.garage
    max_current_a: 32
    reclaim:
      timeout_s: 600
  - id: drive
    grid:
      mode: single
      net_power: sensor.grid_net
    entities:
      cable: binary_sensor.drive_cable
      charging_enable: switch.drive_enable
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(contents.as_bytes()).unwrap();
    tmp
}

#[test]
fn loads_yaml_and_fills_defaults() {
    let tmp = write_config(YAML);
    let cfg = AppConfig::load(Some(tmp.path())).unwrap();
    cfg.validate().unwrap();

    assert!(cfg.priority.mode_enabled);
    assert_eq!(cfg.chargers.len(), 2);
    let garage = &cfg.chargers[0];
    assert!(matches!(garage.grid, GridConfig::Split { .. }));
    assert_eq!(garage.max_current_a, 32);
    assert_eq!(garage.reclaim.timeout_s, Some(600));
    assert_eq!(garage.thresholds.pair(true), (4000, -2000));

    let drive = &cfg.chargers[1];
    assert_eq!(drive.display_name(), "drive");
    assert_eq!(drive.scan_interval_s, 30);
    assert_eq!(drive.sustain_s, 120);
    assert!(drive.phase_switch.is_none());
}

#[test]
fn watched_entities_cover_grid_and_device() {
    let tmp = write_config(YAML);
    let cfg = AppConfig::load(Some(tmp.path())).unwrap();
    let watched = cfg.chargers[0].watched_entities();
    for entity in [
        "sensor.grid_import",
        "sensor.grid_export",
        "binary_sensor.garage_cable",
        "switch.garage_enable",
        "lock.garage",
    ] {
        assert!(watched.iter().any(|w| w == entity), "missing {entity}");
    }
}

#[test]
fn duplicate_charger_ids_are_rejected() {
    let tmp = write_config(YAML);
    let mut cfg = AppConfig::load(Some(tmp.path())).unwrap();
    let mut copy = cfg.chargers[0].clone();
    copy.name = "Other".into();
    cfg.chargers.push(copy);
    match cfg.validate() {
        Err(EvcmError::Validation { field, message }) => {
            assert_eq!(field, "chargers.garage");
            assert_eq!(message, "duplicate_id");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn unknown_timezone_is_rejected() {
    let cfg = AppConfig {
        timezone: "Mars/Olympus".into(),
        ..AppConfig::default()
    };
    assert!(matches!(cfg.validate(), Err(EvcmError::Validation { .. })));
}

#[test]
fn save_and_reload_keeps_chargers() {
    let tmp = write_config(YAML);
    let cfg = AppConfig::load(Some(tmp.path())).unwrap();
    let out = tempfile::NamedTempFile::new().unwrap();
    cfg.save_to_file(out.path()).unwrap();
    let reloaded = AppConfig::from_file(out.path()).unwrap();
    assert_eq!(reloaded.chargers.len(), 2);
    assert_eq!(reloaded.chargers[0].id, "garage");
    assert_eq!(reloaded.chargers[0].grid, cfg.chargers[0].grid);
}

#[test]
fn malformed_yaml_is_an_error() {
    let tmp = write_config("chargers: [ {id: ");
    assert!(AppConfig::load(Some(tmp.path())).is_err());
}

#[test]
fn schema_describes_chargers() {
    let schema = config_schema();
    let text = schema.to_string();
    assert!(text.contains("chargers"));
    assert!(text.contains("scan_interval_s"));
}
