//! Named bus handles.
//!
//! A bus handle is what the registry hands out for a configured SPI or I2C bus. The
//! handle itself never changes identity across reconfiguration: when the bus number
//! behind a name changes, the handle is re-pointed in place. Anything that captured
//! an `Arc` to it (an analog reader, a caller of `spi_by_name`) sees the new bus on
//! its next transfer.
//!
//! The bus number lives in an [`AtomicU32`] so transfers read it without taking the
//! board lock. Transactions on one bus are serialized by a per-bus mutex held for the
//! lifetime of the handle returned by `open_handle`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{BoardError, BoardResult};
use crate::platform::{I2cConnection, Platform, SpiTransfer};

// =============================================================================
// SPI
// =============================================================================

/// A configured SPI bus.
pub struct SpiBus {
    name: String,
    bus: AtomicU32,
    closed: AtomicBool,
    transaction: Mutex<()>,
    platform: Arc<dyn Platform>,
}

impl std::fmt::Debug for SpiBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiBus")
            .field("name", &self.name)
            .field("bus", &self.bus_index())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl SpiBus {
    /// Create a handle for bus index `bus`.
    pub fn new(name: impl Into<String>, bus: u32, platform: Arc<dyn Platform>) -> Self {
        Self {
            name: name.into(),
            bus: AtomicU32::new(bus),
            closed: AtomicBool::new(false),
            transaction: Mutex::new(()),
            platform,
        }
    }

    /// Configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently selected bus index.
    pub fn bus_index(&self) -> u32 {
        self.bus.load(Ordering::Acquire)
    }

    /// Re-point this handle at another bus index.
    pub fn reset(&self, bus: u32) {
        let previous = self.bus.swap(bus, Ordering::AcqRel);
        debug!(spi = %self.name, from = previous, to = bus, "re-pointed SPI bus");
    }

    /// Whether the bus has been removed from the board.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the bus closed. SPI holds no device open between transfers.
    pub fn close(&self) -> BoardResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Take exclusive use of the bus until the returned handle is dropped.
    pub fn open_handle(&self) -> SpiHandle<'_> {
        SpiHandle {
            bus: self,
            _transaction: self.transaction.lock(),
        }
    }
}

/// Exclusive access to an [`SpiBus`].
pub struct SpiHandle<'a> {
    bus: &'a SpiBus,
    _transaction: MutexGuard<'a, ()>,
}

impl SpiHandle<'_> {
    /// Full-duplex transfer to the device at `chip_select`.
    pub fn xfer(&self, baud_hz: u32, chip_select: &str, mode: u8, tx: &[u8]) -> BoardResult<Vec<u8>> {
        if self.bus.is_closed() {
            return Err(BoardError::Closed(format!("SPI bus {}", self.bus.name)));
        }
        self.bus.platform.spi_transfer(SpiTransfer {
            bus: self.bus.bus_index(),
            chip_select,
            baud_hz,
            mode,
            tx,
        })
    }
}

// =============================================================================
// I2C
// =============================================================================

/// A configured I2C bus with an open adapter.
pub struct I2cBus {
    name: String,
    bus: AtomicU32,
    connection: Mutex<Option<Box<dyn I2cConnection>>>,
    platform: Arc<dyn Platform>,
}

impl std::fmt::Debug for I2cBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I2cBus")
            .field("name", &self.name)
            .field("bus", &self.bus_number())
            .finish()
    }
}

impl I2cBus {
    /// Open the adapter for bus number `bus`.
    pub fn open(name: impl Into<String>, bus: u32, platform: Arc<dyn Platform>) -> BoardResult<Self> {
        let connection = platform.open_i2c(bus)?;
        Ok(Self {
            name: name.into(),
            bus: AtomicU32::new(bus),
            connection: Mutex::new(Some(connection)),
            platform,
        })
    }

    /// Configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently selected bus number.
    pub fn bus_number(&self) -> u32 {
        self.bus.load(Ordering::Acquire)
    }

    /// Close the current adapter and open bus `bus` in its place.
    ///
    /// A failure to close the old adapter is logged. A failure to open the new one
    /// is returned and leaves the bus selecting `bus` with no adapter, which
    /// [`is_open`](Self::is_open) reports.
    pub fn reset(&self, bus: u32) -> BoardResult<()> {
        let mut connection = self.connection.lock();
        if let Some(old) = connection.take() {
            if let Err(e) = old.close() {
                warn!(i2c = %self.name, error = %e, "error closing I2C bus while reconfiguring");
            }
        }
        self.bus.store(bus, Ordering::Release);
        *connection = Some(self.platform.open_i2c(bus)?);
        debug!(i2c = %self.name, bus, "re-opened I2C bus");
        Ok(())
    }

    /// Whether an adapter is currently open.
    pub fn is_open(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Close the adapter. Later handles fail with `Closed`.
    pub fn close(&self) -> BoardResult<()> {
        match self.connection.lock().take() {
            Some(connection) => connection.close(),
            None => Ok(()),
        }
    }

    /// Take exclusive use of the bus to talk to the device at `address`.
    pub fn open_handle(&self, address: u8) -> I2cHandle<'_> {
        I2cHandle {
            name: &self.name,
            address,
            connection: self.connection.lock(),
        }
    }
}

/// Exclusive access to one device on an [`I2cBus`].
pub struct I2cHandle<'a> {
    name: &'a str,
    address: u8,
    connection: MutexGuard<'a, Option<Box<dyn I2cConnection>>>,
}

impl I2cHandle<'_> {
    fn connection(&self) -> BoardResult<&dyn I2cConnection> {
        self.connection
            .as_deref()
            .ok_or_else(|| BoardError::Closed(format!("I2C bus {}", self.name)))
    }

    /// Write raw bytes to the device.
    pub fn write_bytes(&self, data: &[u8]) -> BoardResult<()> {
        self.connection()?.write(self.address, data)
    }

    /// Read `count` raw bytes from the device.
    pub fn read_bytes(&self, count: usize) -> BoardResult<Vec<u8>> {
        self.connection()?.read(self.address, count)
    }

    /// Write one byte to register `register`.
    pub fn write_byte_data(&self, register: u8, data: u8) -> BoardResult<()> {
        self.write_bytes(&[register, data])
    }

    /// Read one byte from register `register`.
    pub fn read_byte_data(&self, register: u8) -> BoardResult<u8> {
        let connection = self.connection()?;
        connection.write(self.address, &[register])?;
        let data = connection.read(self.address, 1)?;
        data.first()
            .copied()
            .ok_or_else(|| BoardError::Hardware(format!("empty read from {:#04x}", self.address)))
    }
}
