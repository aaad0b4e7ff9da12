//! Analog channels.
//!
//! An analog channel is an MCP3008 ADC input behind a named SPI bus, optionally
//! smoothed by a background sampler. The registry hands out [`AnalogChannel`]
//! wrappers whose identity survives reconfiguration: when a channel's chip select
//! changes, the wrapper closes its old reader and installs a new one in place. When
//! the channel is removed, the wrapper is left without a reader and every read
//! reports `Closed`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::SpiBus;
use crate::config::AnalogConfig;
use crate::error::{BoardError, BoardResult};

/// MCP3008 clock rate.
const MCP3008_BAUD_HZ: u32 = 1_000_000;

/// A source of raw analog samples.
#[async_trait]
pub trait AnalogReader: Send + Sync {
    /// Take one sample.
    async fn read(&self) -> BoardResult<i32>;

    /// Release anything the reader holds.
    async fn close(&self) -> BoardResult<()>;
}

// =============================================================================
// MCP3008
// =============================================================================

/// Single-ended read of one MCP3008 channel.
pub struct Mcp3008Reader {
    channel: u8,
    bus: Arc<SpiBus>,
    chip_select: String,
}

impl Mcp3008Reader {
    /// Reader for `channel` of the ADC at `chip_select` on `bus`.
    pub fn new(channel: u8, bus: Arc<SpiBus>, chip_select: impl Into<String>) -> Self {
        Self {
            channel,
            bus,
            chip_select: chip_select.into(),
        }
    }

    fn read_blocking(&self) -> BoardResult<i32> {
        // start bit, single-ended mode + channel, then clocks for the 10-bit result
        let tx = [0x01, (8 + self.channel) << 4, 0x00];
        let rx = self
            .bus
            .open_handle()
            .xfer(MCP3008_BAUD_HZ, &self.chip_select, 0, &tx)?;
        if rx.len() < 3 {
            return Err(BoardError::Hardware(format!(
                "short MCP3008 response ({} bytes)",
                rx.len()
            )));
        }
        // Only the final 10 bits are valid.
        Ok(0x03FF & ((i32::from(rx[1]) << 8) | i32::from(rx[2])))
    }
}

#[async_trait]
impl AnalogReader for Mcp3008Reader {
    async fn read(&self) -> BoardResult<i32> {
        let reader = Self {
            channel: self.channel,
            bus: self.bus.clone(),
            chip_select: self.chip_select.clone(),
        };
        tokio::task::spawn_blocking(move || reader.read_blocking())
            .await
            .map_err(BoardError::hardware)?
    }

    async fn close(&self) -> BoardResult<()> {
        Ok(())
    }
}

// =============================================================================
// Smoothing
// =============================================================================

/// Fixed-size moving average.
#[derive(Debug)]
struct RollingAverage {
    window: VecDeque<i32>,
    capacity: usize,
    sum: i64,
}

impl RollingAverage {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0,
        }
    }

    fn add(&mut self, value: i32) {
        if self.window.len() == self.capacity {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= i64::from(oldest);
            }
        }
        self.window.push_back(value);
        self.sum += i64::from(value);
    }

    fn average(&self) -> Option<i32> {
        if self.window.is_empty() {
            return None;
        }
        Some((self.sum / self.window.len() as i64) as i32)
    }
}

/// Background-sampled moving average over a raw reader.
///
/// With smoothing disabled (zero window or zero rate) reads go straight to the raw
/// reader and no task is spawned.
pub struct AnalogSmoother {
    raw: Arc<dyn AnalogReader>,
    average: Option<Arc<Mutex<RollingAverage>>>,
    last_error: Arc<Mutex<Option<String>>>,
    stop_tx: watch::Sender<bool>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl AnalogSmoother {
    /// Start smoothing `raw` with the window and rate from `config`.
    ///
    /// Must be called from within a Tokio runtime when smoothing is enabled.
    pub fn new(raw: Arc<dyn AnalogReader>, config: &AnalogConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let last_error = Arc::new(Mutex::new(None));

        if !config.smoothing_enabled() {
            debug!(analog = %config.name, "smoothing disabled, reading raw values");
            return Self {
                raw,
                average: None,
                last_error,
                stop_tx,
                sampler: Mutex::new(None),
            };
        }

        let samples = (config.samples_per_sec as u64 * config.average_over_ms as u64) / 1000;
        let average = Arc::new(Mutex::new(RollingAverage::new(samples as usize)));
        let interval = Duration::from_nanos(1_000_000_000 / u64::from(config.samples_per_sec));

        let sampler = tokio::spawn(sample_loop(
            raw.clone(),
            average.clone(),
            last_error.clone(),
            interval,
            stop_rx,
        ));

        Self {
            raw,
            average: Some(average),
            last_error,
            stop_tx,
            sampler: Mutex::new(Some(sampler)),
        }
    }
}

async fn sample_loop(
    raw: Arc<dyn AnalogReader>,
    average: Arc<Mutex<RollingAverage>>,
    last_error: Arc<Mutex<Option<String>>>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let started = Instant::now();
        match raw.read().await {
            Ok(value) => {
                average.lock().add(value);
                *last_error.lock() = None;
            }
            Err(e) if e.is_closed() => {
                debug!("raw analog reader closed; stopping sampler");
                return;
            }
            Err(e) => *last_error.lock() = Some(e.to_string()),
        }

        let remaining = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(remaining) => {}
        }
        if *stop_rx.borrow() {
            return;
        }
    }
}

#[async_trait]
impl AnalogReader for AnalogSmoother {
    async fn read(&self) -> BoardResult<i32> {
        let Some(average) = &self.average else {
            return self.raw.read().await;
        };
        if let Some(message) = self.last_error.lock().clone() {
            return Err(BoardError::Hardware(message));
        }
        let current = average.lock().average();
        match current {
            Some(value) => Ok(value),
            // No sample collected yet.
            None => self.raw.read().await,
        }
    }

    async fn close(&self) -> BoardResult<()> {
        let _ = self.stop_tx.send(true);
        let sampler = self.sampler.lock().take();
        if let Some(sampler) = sampler {
            if let Err(e) = sampler.await {
                warn!(error = %e, "analog sampler task failed");
            }
        }
        self.raw.close().await
    }
}

/// Build the smoothed MCP3008 reader described by `config` on `bus`.
pub fn smoothed_mcp3008(config: &AnalogConfig, bus: Arc<SpiBus>) -> BoardResult<Box<dyn AnalogReader>> {
    let channel = config.channel()?;
    let raw = Arc::new(Mcp3008Reader::new(channel, bus, config.chip_select.clone()));
    Ok(Box::new(AnalogSmoother::new(raw, config)))
}

// =============================================================================
// Wrapper
// =============================================================================

struct AnalogSlot {
    chip_select: String,
    /// Descriptor the installed reader was built from, when built by the board.
    source: Option<AnalogConfig>,
    /// Bus the installed reader transfers on, when built by the board.
    bus: Option<Arc<SpiBus>>,
    reader: Option<Box<dyn AnalogReader>>,
}

/// Stable handle to a named analog channel.
pub struct AnalogChannel {
    name: String,
    slot: RwLock<AnalogSlot>,
}

impl std::fmt::Debug for AnalogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogChannel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AnalogChannel {
    /// Wrap `reader` for the ADC at `chip_select`.
    pub fn new(
        name: impl Into<String>,
        chip_select: impl Into<String>,
        reader: Box<dyn AnalogReader>,
    ) -> Self {
        Self {
            name: name.into(),
            slot: RwLock::new(AnalogSlot {
                chip_select: chip_select.into(),
                source: None,
                bus: None,
                reader: Some(reader),
            }),
        }
    }

    pub(crate) fn from_config(
        config: &AnalogConfig,
        bus: Arc<SpiBus>,
        reader: Box<dyn AnalogReader>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            slot: RwLock::new(AnalogSlot {
                chip_select: config.chip_select.clone(),
                source: Some(config.clone()),
                bus: Some(bus),
                reader: Some(reader),
            }),
        }
    }

    /// Configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest (smoothed) sample.
    pub async fn read(&self) -> BoardResult<i32> {
        let slot = self.slot.read().await;
        match &slot.reader {
            Some(reader) => reader.read().await,
            None => Err(BoardError::Closed(format!("analog reader {}", self.name))),
        }
    }

    /// Chip select of the installed reader.
    pub async fn chip_select(&self) -> String {
        self.slot.read().await.chip_select.clone()
    }

    /// Whether no reader is installed.
    pub async fn is_closed(&self) -> bool {
        self.slot.read().await.reader.is_none()
    }

    /// Close the current reader and install `reader` (or nothing) in its place.
    ///
    /// A failure to close the old reader is logged and otherwise ignored.
    pub async fn reset(&self, chip_select: impl Into<String>, reader: Option<Box<dyn AnalogReader>>) {
        self.swap(chip_select.into(), None, None, reader).await;
    }

    /// Close the reader and leave the channel empty.
    pub async fn close(&self) {
        self.reset("", None).await;
    }

    /// Whether the installed reader was built from `config` on this exact `bus`.
    ///
    /// A bus that was removed and configured again under the same name is a
    /// different handle, so the channel counts as changed.
    pub(crate) async fn matches(&self, config: &AnalogConfig, bus: &Arc<SpiBus>) -> bool {
        let slot = self.slot.read().await;
        slot.reader.is_some()
            && slot.source.as_ref() == Some(config)
            && slot.bus.as_ref().is_some_and(|current| Arc::ptr_eq(current, bus))
    }

    pub(crate) async fn replace(
        &self,
        config: &AnalogConfig,
        bus: Arc<SpiBus>,
        reader: Box<dyn AnalogReader>,
    ) {
        self.swap(
            config.chip_select.clone(),
            Some(config.clone()),
            Some(bus),
            Some(reader),
        )
        .await;
    }

    async fn swap(
        &self,
        chip_select: String,
        source: Option<AnalogConfig>,
        bus: Option<Arc<SpiBus>>,
        reader: Option<Box<dyn AnalogReader>>,
    ) {
        let mut slot = self.slot.write().await;
        if let Some(previous) = slot.reader.take() {
            if let Err(e) = previous.close().await {
                warn!(analog = %self.name, error = %e, "error closing analog reader");
            }
        }
        slot.reader = reader;
        slot.chip_select = chip_select;
        slot.source = source;
        slot.bus = bus;
    }
}
