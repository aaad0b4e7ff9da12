//! In-memory platform for tests and hardware-less runs.
//!
//! Every observable action (line level changes, SPI transfers, I2C opens and closes)
//! is appended to a shared event log with a timestamp, so tests can check both what
//! happened and in which order. Failures can be injected per line or per bus kind.
//!
//! SPI transfers are answered like an MCP3008: the channel is decoded from the
//! command byte and the configured value for `(bus, chip_select, channel)` is
//! returned in the last 10 bits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{GpioLine, I2cConnection, Platform, SpiTransfer};
use crate::error::{BoardError, BoardResult};

/// Something the mock platform observed.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// A line was driven
    Level {
        line: String,
        high: bool,
        at: Instant,
    },
    /// A hardware PWM generator was programmed
    HardwarePwm {
        line: String,
        duty: f64,
        frequency_hz: f64,
    },
    /// An SPI transfer ran
    SpiTransfer { bus: u32, chip_select: String },
    /// An I2C adapter was opened
    I2cOpen { bus: u32 },
    /// An I2C adapter was closed
    I2cClose { bus: u32 },
}

type EventLog = Arc<Mutex<Vec<MockEvent>>>;

/// Simulated GPIO line.
pub struct MockLine {
    name: String,
    level: AtomicBool,
    hardware_pwm: bool,
    fail_writes: AtomicBool,
    events: EventLog,
}

impl MockLine {
    /// Make every subsequent `set_level` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current simulated level.
    pub fn is_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

impl GpioLine for MockLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_level(&self, high: bool) -> BoardResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BoardError::Hardware(format!(
                "injected write failure on {}",
                self.name
            )));
        }
        self.level.store(high, Ordering::SeqCst);
        self.events.lock().push(MockEvent::Level {
            line: self.name.clone(),
            high,
            at: Instant::now(),
        });
        Ok(())
    }

    fn level(&self) -> BoardResult<bool> {
        Ok(self.level.load(Ordering::SeqCst))
    }

    fn set_hardware_pwm(&self, duty: f64, frequency_hz: f64) -> BoardResult<()> {
        if !self.hardware_pwm {
            return Err(BoardError::Unsupported(format!(
                "hardware PWM on line {}",
                self.name
            )));
        }
        self.events.lock().push(MockEvent::HardwarePwm {
            line: self.name.clone(),
            duty,
            frequency_hz,
        });
        Ok(())
    }
}

struct MockI2c {
    bus: u32,
    open: AtomicBool,
    fail_close: bool,
    registers: Arc<Mutex<HashMap<(u32, u8), Vec<u8>>>>,
    events: EventLog,
}

impl I2cConnection for MockI2c {
    fn write(&self, address: u8, data: &[u8]) -> BoardResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BoardError::Closed(format!("i2c bus {}", self.bus)));
        }
        self.registers
            .lock()
            .insert((self.bus, address), data.to_vec());
        Ok(())
    }

    fn read(&self, address: u8, len: usize) -> BoardResult<Vec<u8>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BoardError::Closed(format!("i2c bus {}", self.bus)));
        }
        let mut data = self
            .registers
            .lock()
            .get(&(self.bus, address))
            .cloned()
            .unwrap_or_default();
        data.resize(len, 0);
        Ok(data)
    }

    fn close(&self) -> BoardResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.events.lock().push(MockEvent::I2cClose { bus: self.bus });
        if self.fail_close {
            return Err(BoardError::Hardware(format!(
                "injected close failure on i2c bus {}",
                self.bus
            )));
        }
        Ok(())
    }
}

/// In-memory [`Platform`].
#[derive(Default)]
pub struct MockPlatform {
    lines: Mutex<HashMap<String, Arc<MockLine>>>,
    adc_values: Mutex<HashMap<(u32, String, u8), u16>>,
    i2c_registers: Arc<Mutex<HashMap<(u32, u8), Vec<u8>>>>,
    fail_spi: AtomicBool,
    fail_i2c_open: AtomicBool,
    fail_i2c_close: AtomicBool,
    events: EventLog,
}

impl MockPlatform {
    /// Create an empty platform with no lines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a platform exposing `names` as plain (software PWM only) lines.
    pub fn with_lines<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let platform = Self::new();
        for name in names {
            platform.add_line(name, false);
        }
        platform
    }

    /// Add a line to the global namespace.
    pub fn add_line(&self, name: impl Into<String>, hardware_pwm: bool) -> Arc<MockLine> {
        let name = name.into();
        let line = Arc::new(MockLine {
            name: name.clone(),
            level: AtomicBool::new(false),
            hardware_pwm,
            fail_writes: AtomicBool::new(false),
            events: self.events.clone(),
        });
        self.lines.lock().insert(name, line.clone());
        line
    }

    /// Concrete handle to a line, for failure injection and inspection.
    pub fn line(&self, name: &str) -> Option<Arc<MockLine>> {
        self.lines.lock().get(name).cloned()
    }

    /// Value returned by the simulated ADC at `bus`/`chip_select`/`channel`.
    pub fn set_adc_value(&self, bus: u32, chip_select: &str, channel: u8, value: u16) {
        self.adc_values
            .lock()
            .insert((bus, chip_select.to_string(), channel), value & 0x03FF);
    }

    /// Make every subsequent SPI transfer fail (or succeed again).
    pub fn fail_spi(&self, fail: bool) {
        self.fail_spi.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent I2C open fail (or succeed again).
    pub fn fail_i2c_open(&self, fail: bool) {
        self.fail_i2c_open.store(fail, Ordering::SeqCst);
    }

    /// Make I2C adapters opened from now on fail when closed.
    pub fn fail_i2c_close(&self, fail: bool) {
        self.fail_i2c_close.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    /// Level changes recorded for `line`, oldest first.
    pub fn transitions(&self, line: &str) -> Vec<(bool, Instant)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                MockEvent::Level { line: l, high, at } if l == line => Some((*high, *at)),
                _ => None,
            })
            .collect()
    }
}

impl Platform for MockPlatform {
    fn gpio_line(&self, name: &str) -> Option<Arc<dyn GpioLine>> {
        self.line(name).map(|line| line as Arc<dyn GpioLine>)
    }

    fn spi_transfer(&self, transfer: SpiTransfer<'_>) -> BoardResult<Vec<u8>> {
        if self.fail_spi.load(Ordering::SeqCst) {
            return Err(BoardError::Hardware(format!(
                "injected transfer failure on SPI{}.{}",
                transfer.bus, transfer.chip_select
            )));
        }
        self.events.lock().push(MockEvent::SpiTransfer {
            bus: transfer.bus,
            chip_select: transfer.chip_select.to_string(),
        });

        let mut rx = vec![0u8; transfer.tx.len()];
        if transfer.tx.len() >= 3 {
            let channel = (transfer.tx[1] >> 4).saturating_sub(8);
            let value = self
                .adc_values
                .lock()
                .get(&(transfer.bus, transfer.chip_select.to_string(), channel))
                .copied()
                .unwrap_or(0);
            rx[1] = (value >> 8) as u8;
            rx[2] = (value & 0xFF) as u8;
        }
        Ok(rx)
    }

    fn open_i2c(&self, bus: u32) -> BoardResult<Box<dyn I2cConnection>> {
        if self.fail_i2c_open.load(Ordering::SeqCst) {
            return Err(BoardError::hardware(format_args!(
                "injected open failure on i2c bus {}",
                bus
            )));
        }
        self.events.lock().push(MockEvent::I2cOpen { bus });
        Ok(Box::new(MockI2c {
            bus,
            open: AtomicBool::new(true),
            fail_close: self.fail_i2c_close.load(Ordering::SeqCst),
            registers: self.i2c_registers.clone(),
            events: self.events.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spi_answers_like_an_mcp3008() {
        let platform = MockPlatform::new();
        platform.set_adc_value(0, "1", 5, 0x2AB);
        let rx = platform
            .spi_transfer(SpiTransfer {
                bus: 0,
                chip_select: "1",
                baud_hz: 1_000_000,
                mode: 0,
                tx: &[0x01, (8 + 5) << 4, 0x00],
            })
            .unwrap();
        assert_eq!(0x03FF & ((u16::from(rx[1]) << 8) | u16::from(rx[2])), 0x2AB);
    }

    #[test]
    fn closed_i2c_connection_rejects_io() {
        let platform = MockPlatform::new();
        let conn = platform.open_i2c(1).unwrap();
        conn.write(0x40, &[1, 2]).unwrap();
        assert_eq!(conn.read(0x40, 3).unwrap(), vec![1, 2, 0]);
        conn.close().unwrap();
        assert!(conn.read(0x40, 1).unwrap_err().is_closed());
        assert_eq!(
            platform.events(),
            vec![MockEvent::I2cOpen { bus: 1 }, MockEvent::I2cClose { bus: 1 }]
        );
    }

    #[test]
    fn line_failures_are_injectable() {
        let platform = MockPlatform::with_lines(["7"]);
        let line = platform.line("7").unwrap();
        line.fail_writes(true);
        assert!(line.set_level(true).is_err());
        line.fail_writes(false);
        line.set_level(true).unwrap();
        assert!(line.is_high());
        assert_eq!(platform.transitions("7").len(), 1);
    }
}
