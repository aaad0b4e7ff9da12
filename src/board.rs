//! The board: owner of every configured resource.
//!
//! A [`Board`] is built from a [`BoardModel`] and a [`BoardConfig`] and can be
//! reconfigured any number of times while handles it gave out stay in use. Handles
//! whose name survives a reconfiguration keep their identity; changed parameters
//! are applied to the existing handle in place.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::analog::AnalogChannel;
use crate::bus::{I2cBus, SpiBus};
use crate::config::{AppConfig, BoardConfig};
use crate::error::{BoardError, BoardResult};
use crate::gpio::GpioPin;
use crate::interrupt::DigitalInterrupt;
use crate::model::{BoardModel, ModelRegistry};
use crate::pins::PinResolver;
use crate::platform::Platform;
use crate::pwm::{CancelSignal, LoopExit};
use crate::reconcile::{
    reconcile_by_key, AnalogKind, DigitalInterruptKind, I2cKind, ReconcileReport, SpiKind,
};
use crate::registry::{sorted_names, Resources};

/// Reports of one [`Board::reconfigure`] call, per resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigureSummary {
    /// SPI buses
    pub spis: ReconcileReport,
    /// I2C buses
    pub i2cs: ReconcileReport,
    /// Analog channels
    pub analogs: ReconcileReport,
    /// Digital interrupts
    pub digital_interrupts: ReconcileReport,
}

impl ReconfigureSummary {
    /// Whether the call changed nothing.
    pub fn is_noop(&self) -> bool {
        self.spis.is_noop()
            && self.i2cs.is_noop()
            && self.analogs.is_noop()
            && self.digital_interrupts.is_noop()
    }
}

/// A live-reconfigurable board.
pub struct Board {
    name: String,
    model: BoardModel,
    platform: Arc<dyn Platform>,
    resolver: PinResolver,
    resources: Arc<RwLock<Resources>>,
    cancel: CancelSignal,
    /// Held for the whole teardown; `true` once it finished
    torn_down: Mutex<bool>,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("name", &self.name)
            .field("model", &self.model.name)
            .finish_non_exhaustive()
    }
}

impl Board {
    /// Build a board named after its model and apply `config`.
    pub async fn new(
        model: BoardModel,
        config: &BoardConfig,
        platform: Arc<dyn Platform>,
    ) -> BoardResult<Self> {
        let name = model.name.clone();
        Self::named(name, model, config, platform).await
    }

    /// Build a board called `name` and apply `config`.
    ///
    /// If the initial configuration fails, everything created so far is closed
    /// before the error is returned.
    pub async fn named(
        name: impl Into<String>,
        model: BoardModel,
        config: &BoardConfig,
        platform: Arc<dyn Platform>,
    ) -> BoardResult<Self> {
        let board = Self {
            name: name.into(),
            resolver: PinResolver::new(model.gpio_mappings.clone(), platform.clone()),
            model,
            platform,
            resources: Arc::new(RwLock::new(Resources::new())),
            cancel: CancelSignal::new(),
            torn_down: Mutex::new(false),
        };
        if let Err(e) = board.reconfigure(config).await {
            board.close().await;
            return Err(e);
        }
        info!(board = %board.name, model = %board.model.name, "board ready");
        Ok(board)
    }

    /// Build the board described by an application document.
    pub async fn from_app_config(
        config: &AppConfig,
        models: &ModelRegistry,
        platform: Arc<dyn Platform>,
    ) -> BoardResult<Self> {
        let model = models.get(&config.board.model)?.clone();
        Self::named(&config.board.name, model, &config.board.attributes, platform).await
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model the board was built from.
    pub fn model(&self) -> &BoardModel {
        &self.model
    }

    /// Bring the board's resources in line with `config`.
    ///
    /// Kinds are reconciled in order: SPI buses, I2C buses, analog channels, digital
    /// interrupts. A failure stops the call where it happened; changes already
    /// applied to earlier kinds (or earlier entries of the failing kind) stay.
    #[instrument(skip_all, fields(board = %self.name))]
    pub async fn reconfigure(&self, config: &BoardConfig) -> BoardResult<ReconfigureSummary> {
        config.validate("board")?;

        let mut guard = self.resources.write().await;
        if guard.closed {
            return Err(BoardError::Closed(format!("board {}", self.name)));
        }
        let resources = &mut *guard;
        let mut summary = ReconfigureSummary::default();

        let spi_kind = SpiKind {
            platform: self.platform.clone(),
        };
        summary.spis = reconcile_by_key(&spi_kind, &mut resources.spis, &config.spis).await?;

        let i2c_kind = I2cKind {
            platform: self.platform.clone(),
        };
        summary.i2cs = reconcile_by_key(&i2c_kind, &mut resources.i2cs, &config.i2cs).await?;

        let analog_kind = AnalogKind {
            spis: &resources.spis,
        };
        summary.analogs =
            reconcile_by_key(&analog_kind, &mut resources.analogs, &config.analogs).await?;

        if !self.model.supports_digital_interrupts {
            if !config.digital_interrupts.is_empty() {
                return Err(BoardError::Unsupported(format!(
                    "digital interrupts on {} boards",
                    self.model.name
                )));
            }
        } else {
            let interrupt_kind = DigitalInterruptKind {
                resolver: &self.resolver,
            };
            summary.digital_interrupts = reconcile_by_key(
                &interrupt_kind,
                &mut resources.digital_interrupts,
                &config.digital_interrupts,
            )
            .await?;
        }

        if summary.is_noop() {
            debug!("reconfigure left every resource unchanged");
        } else {
            info!("board reconfigured");
        }
        Ok(summary)
    }

    /// SPI bus by name.
    pub async fn spi_by_name(&self, name: &str) -> Option<Arc<SpiBus>> {
        self.resources.read().await.spis.get(name).cloned()
    }

    /// I2C bus by name.
    pub async fn i2c_by_name(&self, name: &str) -> Option<Arc<I2cBus>> {
        self.resources.read().await.i2cs.get(name).cloned()
    }

    /// Analog channel by name.
    pub async fn analog_by_name(&self, name: &str) -> Option<Arc<AnalogChannel>> {
        self.resources.read().await.analogs.get(name).cloned()
    }

    /// Digital interrupt by name.
    pub async fn digital_interrupt_by_name(&self, name: &str) -> Option<Arc<DigitalInterrupt>> {
        self.resources
            .read()
            .await
            .digital_interrupts
            .get(name)
            .cloned()
    }

    /// Configured SPI bus names, sorted.
    pub async fn spi_names(&self) -> Vec<String> {
        sorted_names(&self.resources.read().await.spis)
    }

    /// Configured I2C bus names, sorted.
    pub async fn i2c_names(&self) -> Vec<String> {
        sorted_names(&self.resources.read().await.i2cs)
    }

    /// Configured analog channel names, sorted.
    pub async fn analog_names(&self) -> Vec<String> {
        sorted_names(&self.resources.read().await.analogs)
    }

    /// Configured digital interrupt names, sorted.
    pub async fn digital_interrupt_names(&self) -> Vec<String> {
        sorted_names(&self.resources.read().await.digital_interrupts)
    }

    /// Pin numbers of the model's numbering map; empty for unmapped models.
    pub fn gpio_pin_names(&self) -> Vec<String> {
        self.resolver.pin_names()
    }

    /// Handle to `pin`.
    pub async fn gpio_pin_by_name(&self, pin: &str) -> BoardResult<GpioPin> {
        if self.resources.read().await.closed {
            return Err(BoardError::Closed(format!("board {}", self.name)));
        }
        let resolved = self.resolver.resolve(pin)?;
        Ok(GpioPin::new(
            pin,
            resolved.line,
            resolved.hw_pwm_supported,
            self.resources.clone(),
            self.cancel.clone(),
        ))
    }

    /// Pulse `pin` at `duty_cycle` and `frequency_hz`.
    pub async fn set_pulse(&self, pin: &str, duty_cycle: f64, frequency_hz: f64) -> BoardResult<()> {
        self.gpio_pin_by_name(pin)
            .await?
            .set_pulse(duty_cycle, frequency_hz)
            .await
    }

    /// Shut the board down.
    ///
    /// Pulse loops are cancelled and joined before any bus, analog or interrupt
    /// handle is closed. Close failures are logged. Concurrent and later calls
    /// return once the first teardown has finished.
    #[instrument(skip_all, fields(board = %self.name))]
    pub async fn close(&self) {
        let mut torn_down = self.torn_down.lock().await;
        if *torn_down {
            return;
        }

        let mut workers = {
            let mut guard = self.resources.write().await;
            guard.closed = true;
            guard.pwms.clear();
            self.cancel.cancel();
            std::mem::take(&mut guard.pwm_workers)
        };

        while let Some(result) = workers.join_next().await {
            match result {
                Ok(LoopExit::Cancelled) | Ok(LoopExit::Stopped) => {}
                Err(e) => warn!(error = %e, "software PWM loop panicked"),
            }
        }
        debug!("pulse loops stopped");

        let mut guard = self.resources.write().await;
        for (name, interrupt) in guard.digital_interrupts.drain() {
            interrupt.close();
            debug!(interrupt = %name, "closed");
        }
        for (_, analog) in guard.analogs.drain() {
            analog.close().await;
        }
        for (name, bus) in guard.i2cs.drain() {
            if let Err(e) = bus.close() {
                warn!(i2c = %name, error = %e, "error closing I2C bus");
            }
        }
        for (name, bus) in guard.spis.drain() {
            if let Err(e) = bus.close() {
                warn!(spi = %name, error = %e, "error closing SPI bus");
            }
        }
        *torn_down = true;
        info!("board closed");
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        // Workers still running hold their own reference to the resources; wake
        // them so they exit.
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalogConfig, I2cConfig, SpiConfig};
    use crate::platform::{MockEvent, MockPlatform};
    use tracing_test::traced_test;

    fn spi(name: &str, bus: &str) -> SpiConfig {
        SpiConfig {
            name: name.into(),
            bus_select: bus.into(),
        }
    }

    #[tokio::test]
    async fn reconfigure_reports_per_kind() {
        let platform = Arc::new(MockPlatform::new());
        let board = Board::new(BoardModel::periph(), &BoardConfig::default(), platform)
            .await
            .unwrap();

        let config = BoardConfig {
            spis: vec![spi("main", "0")],
            analogs: vec![AnalogConfig {
                name: "a0".into(),
                pin: "0".into(),
                spi_bus: "main".into(),
                chip_select: "0".into(),
                average_over_ms: 0,
                samples_per_sec: 0,
            }],
            ..Default::default()
        };
        let summary = board.reconfigure(&config).await.unwrap();
        assert_eq!(summary.spis.added, vec!["main"]);
        assert_eq!(summary.analogs.added, vec!["a0"]);

        let summary = board.reconfigure(&config).await.unwrap();
        assert!(summary.is_noop());
        board.close().await;
    }

    #[tokio::test]
    async fn failed_initial_config_is_an_error() {
        let platform = Arc::new(MockPlatform::new());
        let config = BoardConfig {
            analogs: vec![AnalogConfig {
                name: "a0".into(),
                pin: "0".into(),
                spi_bus: "missing".into(),
                chip_select: "0".into(),
                average_over_ms: 0,
                samples_per_sec: 0,
            }],
            ..Default::default()
        };
        let err = Board::new(BoardModel::periph(), &config, platform)
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Validation { .. }));
    }

    #[tokio::test]
    async fn closed_board_rejects_reconfigure_and_pins() {
        let platform = Arc::new(MockPlatform::with_lines(["GPIO1"]));
        let board = Board::new(BoardModel::periph(), &BoardConfig::default(), platform)
            .await
            .unwrap();
        board.close().await;
        board.close().await;

        assert!(board
            .reconfigure(&BoardConfig::default())
            .await
            .unwrap_err()
            .is_closed());
        assert!(board.gpio_pin_by_name("GPIO1").await.unwrap_err().is_closed());
    }

    fn i2c(name: &str, bus: &str) -> I2cConfig {
        I2cConfig {
            name: name.into(),
            bus: bus.into(),
        }
    }

    #[tokio::test]
    async fn i2c_bus_change_reopens_on_the_new_bus() {
        let platform = Arc::new(MockPlatform::new());
        let config = BoardConfig {
            i2cs: vec![i2c("sensors", "1")],
            ..Default::default()
        };
        let board = Board::new(BoardModel::periph(), &config, platform.clone())
            .await
            .unwrap();
        let handle = board.i2c_by_name("sensors").await.unwrap();

        let config = BoardConfig {
            i2cs: vec![i2c("sensors", "3")],
            ..Default::default()
        };
        let summary = board.reconfigure(&config).await.unwrap();

        assert_eq!(summary.i2cs.updated, vec!["sensors"]);
        assert_eq!(handle.bus_number(), 3);
        assert_eq!(
            platform.events(),
            vec![
                MockEvent::I2cOpen { bus: 1 },
                MockEvent::I2cClose { bus: 1 },
                MockEvent::I2cOpen { bus: 3 },
            ]
        );
        board.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn i2c_close_failure_is_logged_and_name_removed() {
        let platform = Arc::new(MockPlatform::new());
        platform.fail_i2c_close(true);
        let config = BoardConfig {
            i2cs: vec![i2c("sensors", "1")],
            ..Default::default()
        };
        let board = Board::new(BoardModel::periph(), &config, platform)
            .await
            .unwrap();

        board.reconfigure(&BoardConfig::default()).await.unwrap();

        assert!(board.i2c_by_name("sensors").await.is_none());
        assert!(logs_contain("error closing resource while reconfiguring"));
        board.close().await;
    }

    #[tokio::test]
    async fn failed_i2c_reopen_is_reported_and_retried() {
        let platform = Arc::new(MockPlatform::new());
        let config = BoardConfig {
            i2cs: vec![i2c("sensors", "1")],
            ..Default::default()
        };
        let board = Board::new(BoardModel::periph(), &config, platform.clone())
            .await
            .unwrap();
        let handle = board.i2c_by_name("sensors").await.unwrap();

        platform.fail_i2c_open(true);
        let moved = BoardConfig {
            i2cs: vec![i2c("sensors", "9")],
            ..Default::default()
        };
        let summary = board.reconfigure(&moved).await.unwrap();
        assert_eq!(summary.i2cs.failed, vec!["sensors"]);
        assert!(summary.i2cs.updated.is_empty());
        assert!(!handle.is_open());

        // Going back to the original number reopens the adapter.
        platform.fail_i2c_open(false);
        let summary = board.reconfigure(&config).await.unwrap();
        assert_eq!(summary.i2cs.updated, vec!["sensors"]);
        assert!(handle.is_open());
        assert_eq!(handle.bus_number(), 1);
        assert_eq!(handle.open_handle(0x20).read_bytes(1).unwrap(), vec![0]);
        board.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_close_waits_for_teardown() {
        let platform = Arc::new(MockPlatform::with_lines(["GPIO4"]));
        let config = BoardConfig {
            spis: vec![spi("main", "0")],
            ..Default::default()
        };
        let board = Board::new(BoardModel::periph(), &config, platform)
            .await
            .unwrap();
        let bus = board.spi_by_name("main").await.unwrap();
        board.set_pulse("GPIO4", 0.5, 2.0).await.unwrap();

        let (_, closed_when_second_returned) = tokio::join!(board.close(), async {
            tokio::task::yield_now().await;
            board.close().await;
            bus.is_closed()
        });

        assert!(closed_when_second_returned);
    }
}
