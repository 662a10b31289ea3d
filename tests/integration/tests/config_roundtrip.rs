//! Config save/load roundtrip through disk.

use fleetlink_core::config::{BindMode, Config, LogFormat, RobotConfig};
use tempfile::TempDir;

#[test]
fn test_config_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleetlink.json5");

    let mut config = Config::default();
    config.gateway.bind = BindMode::Lan;
    config.gateway.auth_token = Some("fleet-secret".to_string());
    config.control.stream_retry.max_attempts = 5;
    config.logging.format = LogFormat::Json;
    config.robots.push(RobotConfig {
        id: "r1".to_string(),
        endpoint: "wss://r1.fleet.local:7000".to_string(),
        name: Some("Scout".to_string()),
    });
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.gateway.bind, BindMode::Lan);
    assert_eq!(loaded.gateway.auth_token.as_deref(), Some("fleet-secret"));
    assert_eq!(loaded.control.stream_retry.max_attempts, 5);
    assert_eq!(loaded.logging.format, LogFormat::Json);
    assert_eq!(loaded.robots, config.robots);
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_cli_init_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleetlink.json5");

    fleetlink_cli::commands::config::init(&path, false).unwrap();
    assert!(fleetlink_cli::commands::config::init(&path, false).is_err());

    let loaded = Config::load_from(Some(&path)).unwrap();
    assert_eq!(loaded.gateway.port, 8080);
    assert_eq!(loaded.gateway.realtime_port, 8081);
}

#[test]
fn test_hand_written_json5_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleetlink.json5");
    std::fs::write(
        &path,
        r#"{
            // two robots on the yard network
            robots: [
                { id: "r1", endpoint: "ws://10.0.0.5:7000" },
                { id: "r2", endpoint: "ws://10.0.0.6:7000", name: "Mule" },
            ],
            control: { idle_timeout_secs: 120 },
        }"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.robots.len(), 2);
    assert_eq!(config.robots[1].name.as_deref(), Some("Mule"));
    assert_eq!(config.control.idle_timeout_secs, 120);
    assert_eq!(config.control.reap_interval_secs, 30);
    assert!(config.validate().is_ok());
}
