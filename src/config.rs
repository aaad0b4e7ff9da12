//! Board configuration types and loading.
//!
//! A board is described by independent descriptor lists, one per resource kind:
//!
//! ```toml
//! [board]
//! model = "periph"
//! name = "local"
//!
//! [[board.attributes.spis]]
//! name = "main"
//! bus_select = "0"
//!
//! [[board.attributes.analogs]]
//! name = "thermistor"
//! pin = "2"
//! spi_bus = "main"
//! chip_select = "0"
//! average_over_ms = 50
//! samples_per_sec = 200
//!
//! [logging]
//! level = "debug"
//! format = "compact"
//! ```
//!
//! Files are loaded through Figment, so every scalar can also be overridden from the
//! environment with the `PERIPH_BOARD_` prefix and `__` as the nesting separator
//! (e.g. `PERIPH_BOARD_LOGGING__LEVEL=trace`).
//!
//! [`BoardConfig::validate`] only checks the shape of each descriptor. References
//! between descriptors (an analog channel naming its SPI bus) are checked while the
//! board reconciles, since that is where the referenced bus has to actually exist.

use std::collections::HashSet;
use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BoardError, BoardResult};

/// Highest channel index on an MCP3008.
pub const MAX_ANALOG_CHANNEL: u8 = 7;

/// SPI bus descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiConfig {
    /// Resource name
    pub name: String,
    /// Bus index as written in the config (e.g. `"0"` for `/dev/spidev0.*`)
    pub bus_select: String,
}

impl SpiConfig {
    /// Parsed bus index.
    pub fn bus_index(&self) -> BoardResult<u32> {
        parse_number(&self.bus_select, &format!("spis.{}.bus_select", self.name))
    }
}

/// I2C bus descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2cConfig {
    /// Resource name
    pub name: String,
    /// Bus number as written in the config (e.g. `"1"` for `/dev/i2c-1`)
    pub bus: String,
}

impl I2cConfig {
    /// Parsed bus number.
    pub fn bus_number(&self) -> BoardResult<u32> {
        parse_number(&self.bus, &format!("i2cs.{}.bus", self.name))
    }
}

/// Analog channel descriptor for an MCP3008 behind a named SPI bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogConfig {
    /// Resource name
    pub name: String,
    /// ADC channel index
    pub pin: String,
    /// Name of the SPI bus the ADC sits on
    pub spi_bus: String,
    /// Chip select line of the ADC on that bus
    pub chip_select: String,
    /// Averaging window; zero disables smoothing
    #[serde(default)]
    pub average_over_ms: u32,
    /// Sampling rate of the smoother; zero disables smoothing
    #[serde(default)]
    pub samples_per_sec: u32,
}

impl AnalogConfig {
    /// Parsed ADC channel.
    pub fn channel(&self) -> BoardResult<u8> {
        let path = format!("analogs.{}.pin", self.name);
        let channel = parse_number(&self.pin, &path)?;
        if channel > u32::from(MAX_ANALOG_CHANNEL) {
            return Err(BoardError::validation(
                path,
                format!("channel {} out of range 0..={}", channel, MAX_ANALOG_CHANNEL),
            ));
        }
        Ok(channel as u8)
    }

    /// Whether a background smoother should run for this channel.
    pub fn smoothing_enabled(&self) -> bool {
        self.average_over_ms > 0 && self.samples_per_sec > 0
    }
}

/// Digital interrupt descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalInterruptConfig {
    /// Resource name
    pub name: String,
    /// Pin identifier, resolved like any other GPIO pin
    pub pin: String,
}

/// All resource descriptors for one board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// SPI buses
    #[serde(default)]
    pub spis: Vec<SpiConfig>,
    /// I2C buses
    #[serde(default)]
    pub i2cs: Vec<I2cConfig>,
    /// Analog channels
    #[serde(default)]
    pub analogs: Vec<AnalogConfig>,
    /// Digital interrupts
    #[serde(default)]
    pub digital_interrupts: Vec<DigitalInterruptConfig>,
}

impl BoardConfig {
    /// Check the shape of every descriptor.
    ///
    /// Errors carry `path` joined with the list name, index and field, e.g.
    /// `board.analogs.1.pin`.
    pub fn validate(&self, path: &str) -> BoardResult<()> {
        let mut seen = HashSet::new();
        for (idx, c) in self.spis.iter().enumerate() {
            let at = format!("{}.spis.{}", path, idx);
            require_name(&c.name, &at, &mut seen)?;
            parse_number(&c.bus_select, &format!("{}.bus_select", at))?;
        }

        let mut seen = HashSet::new();
        for (idx, c) in self.i2cs.iter().enumerate() {
            let at = format!("{}.i2cs.{}", path, idx);
            require_name(&c.name, &at, &mut seen)?;
            parse_number(&c.bus, &format!("{}.bus", at))?;
        }

        let mut seen = HashSet::new();
        for (idx, c) in self.analogs.iter().enumerate() {
            let at = format!("{}.analogs.{}", path, idx);
            require_name(&c.name, &at, &mut seen)?;
            let channel = parse_number(&c.pin, &format!("{}.pin", at))?;
            if channel > u32::from(MAX_ANALOG_CHANNEL) {
                return Err(BoardError::validation(
                    format!("{}.pin", at),
                    format!("channel {} out of range 0..={}", channel, MAX_ANALOG_CHANNEL),
                ));
            }
            if c.spi_bus.is_empty() {
                return Err(BoardError::validation(
                    format!("{}.spi_bus", at),
                    "field is required",
                ));
            }
            if c.chip_select.is_empty() {
                return Err(BoardError::validation(
                    format!("{}.chip_select", at),
                    "field is required",
                ));
            }
        }

        let mut seen = HashSet::new();
        for (idx, c) in self.digital_interrupts.iter().enumerate() {
            let at = format!("{}.digital_interrupts.{}", path, idx);
            require_name(&c.name, &at, &mut seen)?;
            if c.pin.is_empty() {
                return Err(BoardError::validation(format!("{}.pin", at), "field is required"));
            }
        }
        Ok(())
    }
}

fn require_name<'a>(name: &'a str, at: &str, seen: &mut HashSet<&'a str>) -> BoardResult<()> {
    if name.is_empty() {
        return Err(BoardError::validation(format!("{}.name", at), "field is required"));
    }
    if !seen.insert(name) {
        return Err(BoardError::validation(
            format!("{}.name", at),
            format!("duplicate name \"{}\"", name),
        ));
    }
    Ok(())
}

fn parse_number(value: &str, path: &str) -> BoardResult<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| BoardError::validation(path, format!("\"{}\" is not a number", value)))
}

// =============================================================================
// Application document
// =============================================================================

/// Board section of the application document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSection {
    /// Board model name, looked up in the model registry
    #[serde(default = "default_model")]
    pub model: String,
    /// Instance name used in log output
    #[serde(default = "default_board_name")]
    pub name: String,
    /// Resource descriptors
    #[serde(default)]
    pub attributes: BoardConfig,
}

impl Default for BoardSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            name: default_board_name(),
            attributes: BoardConfig::default(),
        }
    }
}

/// Logging section of the application document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// The board to expose
    #[serde(default)]
    pub board: BoardSection,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingSection,
}

fn default_model() -> String {
    "periph".to_string()
}

fn default_board_name() -> String {
    "board".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl AppConfig {
    /// Load from a TOML or JSON file (by extension) plus `PERIPH_BOARD_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BoardResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BoardError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "loading board config");

        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Figment::new().merge(Json::file(path)),
            _ => Figment::new().merge(Toml::file(path)),
        };
        let config: AppConfig = figment
            .merge(Env::prefixed("PERIPH_BOARD_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml_str(contents: &str) -> BoardResult<Self> {
        let config: AppConfig = Figment::new().merge(Toml::string(contents)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> BoardResult<()> {
        if self.board.model.is_empty() {
            return Err(BoardError::validation("board.model", "field is required"));
        }
        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => {
                return Err(BoardError::validation(
                    "logging.format",
                    format!("unknown format \"{}\"", other),
                ))
            }
        }
        self.board.attributes.validate("board.attributes")
    }
}
