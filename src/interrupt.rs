//! Digital interrupts for board models that support them.
//!
//! An interrupt is bound to a resolved pin and counts rising edges reported through
//! [`DigitalInterrupt::tick`]. Edge detection itself belongs to whatever drives the
//! line (a poller, an event file descriptor); the board only owns the handle and
//! keeps it stable across reconfiguration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BoardError, BoardResult};
use crate::platform::GpioLine;

struct Binding {
    pin: String,
    line: Arc<dyn GpioLine>,
}

/// Named edge counter on one pin.
pub struct DigitalInterrupt {
    name: String,
    binding: Mutex<Binding>,
    ticks: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for DigitalInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalInterrupt")
            .field("name", &self.name)
            .field("pin", &self.pin())
            .field("ticks", &self.value())
            .finish()
    }
}

impl DigitalInterrupt {
    /// Interrupt `name` on `pin`, backed by `line`.
    pub fn new(name: impl Into<String>, pin: impl Into<String>, line: Arc<dyn GpioLine>) -> Self {
        Self {
            name: name.into(),
            binding: Mutex::new(Binding {
                pin: pin.into(),
                line,
            }),
            ticks: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pin identifier the interrupt is bound to.
    pub fn pin(&self) -> String {
        self.binding.lock().pin.clone()
    }

    /// Number of rising edges seen.
    pub fn value(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Current level of the bound line.
    pub fn level(&self) -> BoardResult<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BoardError::Closed(format!("digital interrupt {}", self.name)));
        }
        let line = self.binding.lock().line.clone();
        line.level()
    }

    /// Report an edge; rising edges are counted. Returns the new count.
    pub fn tick(&self, high: bool) -> BoardResult<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BoardError::Closed(format!("digital interrupt {}", self.name)));
        }
        if high {
            return Ok(self.ticks.fetch_add(1, Ordering::AcqRel) + 1);
        }
        Ok(self.value())
    }

    /// Move the interrupt to another pin, restarting the count.
    pub fn reset(&self, pin: impl Into<String>, line: Arc<dyn GpioLine>) {
        let mut binding = self.binding.lock();
        binding.pin = pin.into();
        binding.line = line;
        self.ticks.store(0, Ordering::Release);
        debug!(interrupt = %self.name, pin = %binding.pin, "re-bound digital interrupt");
    }

    /// Stop accepting edges.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MockPlatform, Platform};

    #[test]
    fn counts_rising_edges_and_resets_on_rebind() {
        let platform = MockPlatform::with_lines(["5", "6"]);
        let interrupt = DigitalInterrupt::new("counter", "5", platform.gpio_line("5").unwrap());
        interrupt.tick(true).unwrap();
        interrupt.tick(false).unwrap();
        assert_eq!(interrupt.tick(true).unwrap(), 2);

        interrupt.reset("6", platform.gpio_line("6").unwrap());
        assert_eq!(interrupt.pin(), "6");
        assert_eq!(interrupt.value(), 0);

        interrupt.close();
        assert!(interrupt.tick(true).unwrap_err().is_closed());
    }
}
