//! Integration tests for loading board config files.

use std::io::Write;
use std::sync::Arc;

use periph_board::config::AppConfig;
use periph_board::{Board, BoardError, MockPlatform, ModelRegistry};
use tempfile::NamedTempFile;

const BOARD_TOML: &str = r#"
[board]
model = "periph"
name = "bench"

[[board.attributes.spis]]
name = "main"
bus_select = "0"

[[board.attributes.i2cs]]
name = "sensors"
bus = "1"

[[board.attributes.analogs]]
name = "pot"
pin = "3"
spi_bus = "main"
chip_select = "0"
average_over_ms = 100
samples_per_sec = 50

[logging]
level = "debug"
format = "compact"
"#;

fn write_config(contents: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_load_toml_file() {
    let file = write_config(BOARD_TOML, ".toml");
    let config = AppConfig::load_from(file.path()).expect("Failed to load config");

    assert_eq!(config.board.model, "periph");
    assert_eq!(config.board.attributes.spis.len(), 1);
    assert_eq!(config.board.attributes.analogs[0].samples_per_sec, 50);
    assert_eq!(config.logging.format, "compact");
}

#[test]
fn test_load_json_file() {
    let json = r#"{
        "board": {
            "model": "periph",
            "attributes": {
                "spis": [{ "name": "main", "bus_select": "1" }]
            }
        }
    }"#;
    let file = write_config(json, ".json");
    let config = AppConfig::load_from(file.path()).expect("Failed to load config");

    assert_eq!(config.board.attributes.spis[0].bus_select, "1");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_missing_file_is_a_config_error() {
    let err = AppConfig::load_from("/definitely/not/here.toml").unwrap_err();
    assert!(matches!(err, BoardError::Config(_)));
}

#[test]
fn test_invalid_descriptor_is_reported_with_path() {
    let toml = r#"
[[board.attributes.spis]]
name = "main"
bus_select = "zero"
"#;
    let file = write_config(toml, ".toml");
    let err = AppConfig::load_from(file.path()).unwrap_err();
    assert!(
        err.to_string().contains("board.attributes.spis.0.bus_select"),
        "{err}"
    );
}

#[test]
fn test_unknown_model_is_rejected() {
    let file = write_config("[board]\nmodel = \"mystery\"\n", ".toml");
    let config = AppConfig::load_from(file.path()).expect("Failed to load config");
    let err = ModelRegistry::new().get(&config.board.model).unwrap_err();
    assert!(err.to_string().contains("board.model"));
}

#[tokio::test]
async fn test_board_from_loaded_config() {
    let file = write_config(BOARD_TOML, ".toml");
    let config = AppConfig::load_from(file.path()).expect("Failed to load config");
    let platform = Arc::new(MockPlatform::new());

    let board = Board::from_app_config(&config, &ModelRegistry::new(), platform)
        .await
        .expect("Failed to build board");

    assert_eq!(board.name(), "bench");
    assert_eq!(board.spi_names().await, vec!["main"]);
    assert_eq!(board.i2c_names().await, vec!["sensors"]);
    assert_eq!(board.analog_names().await, vec!["pot"]);
    board.close().await;
}
