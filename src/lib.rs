//! # periph-board
//!
//! A live-reconfigurable board driver layer. A [`Board`] owns named SPI buses, I2C
//! buses, analog channels and digital interrupts built from a [`BoardConfig`], and
//! pulses GPIO pins in software where the hardware has no PWM generator.
//!
//! ## Crate Structure
//!
//! - **`board`**: the [`Board`] itself: construction, capability lookups,
//!   reconfiguration and shutdown.
//! - **`reconcile`**: the generic name-keyed diff that brings a resource map in
//!   line with a descriptor list.
//! - **`bus`**: SPI and I2C bus handles whose bus selector can be re-pointed in place.
//! - **`analog`**: MCP3008 readers, the rolling-average smoother and the
//!   [`AnalogChannel`] wrapper.
//! - **`gpio`** / **`pwm`**: pin handles and the software PWM workers.
//! - **`pins`** / **`model`**: pin resolution and board models.
//! - **`interrupt`**: digital interrupt handles.
//! - **`platform`**: the hardware seam, with a Linux sysfs/spidev backend and an
//!   in-memory mock.
//! - **`config`** / **`logging`** / **`error`**: the ambient pieces.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use periph_board::{Board, BoardConfig, BoardModel, MockPlatform};
//!
//! # async fn demo() -> periph_board::BoardResult<()> {
//! let platform = Arc::new(MockPlatform::with_lines(["GPIO17"]));
//! let board = Board::new(BoardModel::periph(), &BoardConfig::default(), platform).await?;
//! board.set_pulse("GPIO17", 0.5, 100.0).await?;
//! board.close().await;
//! # Ok(())
//! # }
//! ```

pub mod analog;
pub mod board;
pub mod bus;
pub mod config;
pub mod error;
pub mod gpio;
pub mod interrupt;
pub mod logging;
pub mod model;
pub mod pins;
pub mod platform;
pub mod pwm;
pub mod reconcile;
mod registry;

pub use analog::{AnalogChannel, AnalogReader};
pub use board::{Board, ReconfigureSummary};
pub use bus::{I2cBus, I2cHandle, SpiBus, SpiHandle};
pub use config::{
    AnalogConfig, AppConfig, BoardConfig, DigitalInterruptConfig, I2cConfig, SpiConfig,
};
pub use error::{BoardError, BoardResult};
pub use gpio::GpioPin;
pub use interrupt::DigitalInterrupt;
pub use model::{BoardModel, ModelRegistry};
pub use pins::GpioBoardMapping;
pub use platform::{MockPlatform, Platform};
pub use pwm::PwmSetting;
pub use reconcile::{Change, ReconcileReport};
