//! Hardware access collaborators.
//!
//! The board never touches registers or device files itself. Everything below the
//! resource registry goes through a [`Platform`], which owns the global GPIO line
//! namespace and the raw bus primitives:
//!
//! - [`GpioLine`]: one global line that can be driven and read
//! - [`Platform::spi_transfer`]: a full-duplex transfer on `bus`/`chip_select`
//! - [`I2cConnection`]: an open I2C adapter that can be closed explicitly
//!
//! Two implementations ship with the crate: [`mock::MockPlatform`] for tests and
//! hardware-less runs, and (on Linux) [`sysfs::SysfsPlatform`] backed by
//! `/sys/class/gpio`, `spidev` and `i2c-dev`.

use std::sync::Arc;

use crate::error::{BoardError, BoardResult};

pub mod mock;
#[cfg(target_os = "linux")]
pub mod sysfs;

pub use mock::{MockEvent, MockLine, MockPlatform};
#[cfg(target_os = "linux")]
pub use sysfs::SysfsPlatform;

/// One global GPIO line.
pub trait GpioLine: Send + Sync {
    /// Global line name.
    fn name(&self) -> &str;

    /// Drive the line high or low.
    fn set_level(&self, high: bool) -> BoardResult<()>;

    /// Read the current line level.
    fn level(&self) -> BoardResult<bool>;

    /// Program a hardware PWM generator on this line.
    ///
    /// `duty` is a fraction of the period in `0.0..=1.0`. A zero `frequency_hz`
    /// stops the generator.
    fn set_hardware_pwm(&self, duty: f64, frequency_hz: f64) -> BoardResult<()> {
        let _ = (duty, frequency_hz);
        Err(BoardError::Unsupported(format!(
            "hardware PWM on line {}",
            self.name()
        )))
    }
}

/// Parameters of one SPI transfer.
#[derive(Debug, Clone, Copy)]
pub struct SpiTransfer<'a> {
    /// Bus index
    pub bus: u32,
    /// Chip select line on that bus
    pub chip_select: &'a str,
    /// Clock rate in Hz
    pub baud_hz: u32,
    /// SPI mode (0-3)
    pub mode: u8,
    /// Bytes to send; the response has the same length
    pub tx: &'a [u8],
}

/// An open I2C adapter.
pub trait I2cConnection: Send + Sync {
    /// Write `data` to the device at `address`.
    fn write(&self, address: u8, data: &[u8]) -> BoardResult<()>;

    /// Read `len` bytes from the device at `address`.
    fn read(&self, address: u8, len: usize) -> BoardResult<Vec<u8>>;

    /// Release the adapter. Further use fails.
    fn close(&self) -> BoardResult<()>;
}

/// Access to the hardware a board exposes.
pub trait Platform: Send + Sync {
    /// Look up a line in the global namespace.
    fn gpio_line(&self, name: &str) -> Option<Arc<dyn GpioLine>>;

    /// Run one full-duplex SPI transfer.
    fn spi_transfer(&self, transfer: SpiTransfer<'_>) -> BoardResult<Vec<u8>>;

    /// Open the I2C adapter with the given bus number.
    fn open_i2c(&self, bus: u32) -> BoardResult<Box<dyn I2cConnection>>;
}
