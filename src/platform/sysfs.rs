//! Linux platform backed by the kernel's userspace interfaces.
//!
//! - GPIO lines through `/sys/class/gpio` (exported on first lookup)
//! - SPI through `/dev/spidev<bus>.<chip_select>` and the `SPI_IOC_MESSAGE` ioctl
//! - I2C through `/dev/i2c-<bus>` and the `I2C_SLAVE` ioctl
//!
//! Hardware PWM is not driven through sysfs; lines report it as unsupported and the
//! board falls back to its software PWM loop.
#![allow(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{GpioLine, I2cConnection, Platform, SpiTransfer};
use crate::error::{BoardError, BoardResult};

const GPIO_ROOT: &str = "/sys/class/gpio";
const I2C_SLAVE: libc::c_ulong = 0x0703;

mod ioctl {
    /// `struct spi_ioc_transfer` from `<linux/spi/spidev.h>`.
    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct SpiIocTransfer {
        pub tx_buf: u64,
        pub rx_buf: u64,
        pub len: u32,
        pub speed_hz: u32,
        pub delay_usecs: u16,
        pub bits_per_word: u8,
        pub cs_change: u8,
        pub tx_nbits: u8,
        pub rx_nbits: u8,
        pub word_delay_usecs: u8,
        pub pad: u8,
    }

    nix::ioctl_write_ptr!(spi_write_mode, b'k', 1, u8);
    nix::ioctl_write_buf!(spi_message, b'k', 0, SpiIocTransfer);
    nix::ioctl_write_int_bad!(i2c_set_slave, super::I2C_SLAVE);
}

/// Platform using sysfs GPIO, spidev and i2c-dev.
#[derive(Debug, Clone)]
pub struct SysfsPlatform {
    gpio_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsPlatform {
    /// Use the standard `/sys/class/gpio` and `/dev` locations.
    pub fn new() -> Self {
        Self {
            gpio_root: PathBuf::from(GPIO_ROOT),
            dev_root: PathBuf::from("/dev"),
        }
    }

    /// Use alternative roots (e.g. a chroot or a test fixture).
    pub fn with_roots(gpio_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            gpio_root: gpio_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn export(&self, number: u32) -> BoardResult<PathBuf> {
        let line_dir = self.gpio_root.join(format!("gpio{}", number));
        if !line_dir.exists() {
            debug!(line = number, "exporting gpio line");
            fs::write(self.gpio_root.join("export"), number.to_string())?;
        }
        if !line_dir.exists() {
            return Err(BoardError::PinNotFound(number.to_string()));
        }
        Ok(line_dir)
    }
}

/// Accept `"17"` as well as `"GPIO17"`.
fn line_number(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix("GPIO")
        .or_else(|| name.strip_prefix("gpio"))
        .unwrap_or(name);
    digits.parse().ok()
}

struct SysfsLine {
    name: String,
    dir: PathBuf,
    is_output: AtomicBool,
}

impl SysfsLine {
    fn write_attr(&self, attr: &str, value: &str) -> BoardResult<()> {
        fs::write(self.dir.join(attr), value)
            .map_err(|e| BoardError::Hardware(format!("{}/{}: {}", self.name, attr, e)))
    }
}

impl GpioLine for SysfsLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_level(&self, high: bool) -> BoardResult<()> {
        if !self.is_output.load(Ordering::Acquire) {
            self.write_attr("direction", "out")?;
            self.is_output.store(true, Ordering::Release);
        }
        self.write_attr("value", if high { "1" } else { "0" })
    }

    fn level(&self) -> BoardResult<bool> {
        let raw = fs::read_to_string(self.dir.join("value"))
            .map_err(|e| BoardError::Hardware(format!("{}/value: {}", self.name, e)))?;
        Ok(raw.trim() == "1")
    }
}

struct SysfsI2c {
    bus: u32,
    file: Mutex<Option<File>>,
}

impl SysfsI2c {
    fn with_device<T>(
        &self,
        address: u8,
        op: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> BoardResult<T> {
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| BoardError::Closed(format!("i2c bus {}", self.bus)))?;
        // SAFETY: the fd is owned by `file` and stays open for the duration of the call.
        unsafe { ioctl::i2c_set_slave(file.as_raw_fd(), libc::c_int::from(address)) }
            .map_err(|e| BoardError::Hardware(format!("i2c-{} addr {:#04x}: {}", self.bus, address, e)))?;
        op(file).map_err(|e| BoardError::Hardware(format!("i2c-{} addr {:#04x}: {}", self.bus, address, e)))
    }
}

impl I2cConnection for SysfsI2c {
    fn write(&self, address: u8, data: &[u8]) -> BoardResult<()> {
        self.with_device(address, |file| file.write_all(data))
    }

    fn read(&self, address: u8, len: usize) -> BoardResult<Vec<u8>> {
        self.with_device(address, |file| {
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
    }

    fn close(&self) -> BoardResult<()> {
        // Dropping the file closes the descriptor.
        self.file.lock().take();
        Ok(())
    }
}

impl Platform for SysfsPlatform {
    fn gpio_line(&self, name: &str) -> Option<Arc<dyn GpioLine>> {
        let number = line_number(name)?;
        match self.export(number) {
            Ok(dir) => Some(Arc::new(SysfsLine {
                name: name.to_string(),
                dir,
                is_output: AtomicBool::new(false),
            })),
            Err(e) => {
                warn!(line = name, error = %e, "gpio line unavailable");
                None
            }
        }
    }

    fn spi_transfer(&self, transfer: SpiTransfer<'_>) -> BoardResult<Vec<u8>> {
        let path = self
            .dev_root
            .join(format!("spidev{}.{}", transfer.bus, transfer.chip_select));
        let device = open_rw(&path)?;
        let fd = device.as_raw_fd();

        let mode = transfer.mode;
        // SAFETY: `mode` outlives the call and the fd is open.
        unsafe { ioctl::spi_write_mode(fd, &mode) }
            .map_err(|e| BoardError::Hardware(format!("{}: set mode: {}", path.display(), e)))?;

        let mut rx = vec![0u8; transfer.tx.len()];
        let message = [ioctl::SpiIocTransfer {
            tx_buf: transfer.tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: transfer.tx.len() as u32,
            speed_hz: transfer.baud_hz,
            bits_per_word: 8,
            ..Default::default()
        }];
        // SAFETY: tx and rx are valid for `len` bytes until the ioctl returns.
        unsafe { ioctl::spi_message(fd, &message) }
            .map_err(|e| BoardError::Hardware(format!("{}: transfer: {}", path.display(), e)))?;
        Ok(rx)
    }

    fn open_i2c(&self, bus: u32) -> BoardResult<Box<dyn I2cConnection>> {
        let file = open_rw(&self.dev_root.join(format!("i2c-{}", bus)))?;
        Ok(Box::new(SysfsI2c {
            bus,
            file: Mutex::new(Some(file)),
        }))
    }
}

fn open_rw(path: &Path) -> BoardResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| BoardError::hardware(format_args!("{}: {}", path.display(), e)))
}
