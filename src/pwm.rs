//! Software PWM.
//!
//! Pins without a hardware PWM generator are pulsed by a dedicated blocking worker
//! that toggles the line itself. Each iteration the worker:
//!
//! 1. takes the board's read lock and stops if its line's [`PwmSetting`] is gone
//!    or now belongs to a newer worker
//! 2. drives the line high, drops the lock and sleeps `duty * period`
//! 3. re-checks the setting under the read lock, drives the line low, drops the
//!    lock and sleeps the rest of the period
//!
//! Both sleeps wait on the board-wide [`CancelSignal`], so closing the board wakes
//! every worker at once instead of waiting out the current period. The workers run
//! on the blocking pool rather than the async timer because periods are routinely
//! below the timer's millisecond resolution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{BoardError, BoardResult};
use crate::platform::GpioLine;
use crate::registry::Resources;

/// How long a worker waits before re-reading a setting with no frequency yet.
pub const IDLE_POLL: Duration = Duration::from_millis(10);

/// Duty cycle and frequency of one pulsed pin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmSetting {
    /// Fraction of the period spent high, `0.0..=1.0`
    pub duty_cycle: f64,
    /// Pulses per second; zero means not yet configured
    pub frequency_hz: f64,
    /// Worker that owns this setting
    pub(crate) generation: u64,
}

impl PwmSetting {
    /// Length of one period, or `None` while no frequency is set.
    pub fn period(&self) -> Option<Duration> {
        if self.frequency_hz <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.frequency_hz).ok()
    }

    /// High and low phase lengths.
    pub fn phases(&self) -> Option<(Duration, Duration)> {
        let period = self.period()?;
        let on = period.mul_f64(self.duty_cycle.clamp(0.0, 1.0));
        Some((on, period.saturating_sub(on)))
    }
}

/// Check a duty cycle fraction.
pub fn validate_duty_cycle(duty_cycle: f64) -> BoardResult<()> {
    if !(0.0..=1.0).contains(&duty_cycle) {
        return Err(BoardError::validation(
            "duty_cycle",
            format!("{} outside 0.0..=1.0", duty_cycle),
        ));
    }
    Ok(())
}

/// Check a frequency in Hz.
pub fn validate_frequency(frequency_hz: f64) -> BoardResult<()> {
    if !frequency_hz.is_finite() || frequency_hz < 0.0 {
        return Err(BoardError::validation(
            "frequency_hz",
            format!("{} is not a valid frequency", frequency_hz),
        ));
    }
    Ok(())
}

/// Broadcast cancellation shared by every worker of one board.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelSignal {
    /// A signal that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake every waiter.
    pub fn cancel(&self) {
        let (cancelled, wakeup) = &*self.inner;
        *cancelled.lock() = true;
        wakeup.notify_all();
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (cancelled, wakeup) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut fired = cancelled.lock();
        while !*fired {
            if wakeup.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

/// Why a worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The pin's setting was withdrawn or taken over
    Stopped,
    /// The board was closed
    Cancelled,
}

/// Pulse `line` until its setting goes away or `cancel` fires.
///
/// Settings are looked up by the line's global name; `pin` is only used in log
/// output. Every level change happens under the read lock after confirming the
/// setting is still this worker's, so a digital write (which takes the write lock
/// and withdraws the setting) is never overwritten by a worker waking up.
pub(crate) fn software_pwm_loop(
    resources: Arc<RwLock<Resources>>,
    cancel: CancelSignal,
    pin: String,
    line: Arc<dyn GpioLine>,
    generation: u64,
) -> LoopExit {
    let key = line.name().to_string();
    debug!(pin = %pin, generation, "software PWM loop started");
    loop {
        if cancel.is_cancelled() {
            return LoopExit::Cancelled;
        }

        let phases = {
            let guard = resources.blocking_read();
            let Some(setting) = owned_setting(&guard, &key, generation) else {
                debug!(pin = %pin, "pwm setting deleted; stopping");
                return LoopExit::Stopped;
            };
            let phases = setting.phases();
            if phases.is_some() {
                drive(&*line, &pin, true);
            }
            phases
        };

        let Some((on_period, off_period)) = phases else {
            if cancel.wait_timeout(IDLE_POLL) {
                return LoopExit::Cancelled;
            }
            continue;
        };
        if cancel.wait_timeout(on_period) {
            return LoopExit::Cancelled;
        }

        {
            let guard = resources.blocking_read();
            if owned_setting(&guard, &key, generation).is_none() {
                debug!(pin = %pin, "pwm setting deleted; stopping");
                return LoopExit::Stopped;
            }
            drive(&*line, &pin, false);
        }
        if cancel.wait_timeout(off_period) {
            return LoopExit::Cancelled;
        }
    }
}

fn owned_setting(resources: &Resources, key: &str, generation: u64) -> Option<PwmSetting> {
    resources
        .pwms
        .get(key)
        .copied()
        .filter(|s| s.generation == generation)
}

fn drive(line: &dyn GpioLine, pin: &str, high: bool) {
    if let Err(e) = line.set_level(high) {
        warn!(pin = %pin, error = %e, "error setting pin");
    }
}

/// Spawn the worker for `pin` on the board's join set.
///
/// The caller holds the write lock and has just inserted the setting tagged with
/// `generation`.
pub(crate) fn start_software_pwm_loop(
    guard: &mut Resources,
    shared: &Arc<RwLock<Resources>>,
    cancel: &CancelSignal,
    pin: &str,
    line: Arc<dyn GpioLine>,
    generation: u64,
) {
    guard.reap_finished_workers();
    let resources = shared.clone();
    let cancel = cancel.clone();
    let pin = pin.to_string();
    guard
        .pwm_workers
        .spawn_blocking(move || software_pwm_loop(resources, cancel, pin, line, generation));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;
    use tracing_test::traced_test;

    fn setting(duty_cycle: f64, frequency_hz: f64) -> PwmSetting {
        PwmSetting {
            duty_cycle,
            frequency_hz,
            generation: 1,
        }
    }

    #[test]
    fn phases_split_the_period() {
        let (on, off) = setting(0.5, 1000.0).phases().unwrap();
        assert_eq!(on, Duration::from_micros(500));
        assert_eq!(off, Duration::from_micros(500));

        let (on, off) = setting(0.25, 100.0).phases().unwrap();
        assert_eq!(on, Duration::from_micros(2500));
        assert_eq!(off, Duration::from_micros(7500));
    }

    #[test]
    fn zero_frequency_has_no_period() {
        assert!(setting(0.5, 0.0).phases().is_none());
    }

    #[test]
    fn duty_and_frequency_validation() {
        assert!(validate_duty_cycle(1.0).is_ok());
        assert!(validate_duty_cycle(1.5).is_err());
        assert!(validate_duty_cycle(f64::NAN).is_err());
        assert!(validate_frequency(0.0).is_ok());
        assert!(validate_frequency(f64::INFINITY).is_err());
        assert!(validate_frequency(-1.0).is_err());
    }

    #[test]
    fn cancel_wakes_a_long_wait() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let cancelled = signal.wait_timeout(Duration::from_secs(30));
                (cancelled, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.cancel();

        let (cancelled, waited) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn uncancelled_wait_times_out() {
        let signal = CancelSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    fn shared(pin: &str, setting: PwmSetting) -> Arc<RwLock<Resources>> {
        let mut resources = Resources::new();
        resources.pwms.insert(pin.to_string(), setting);
        Arc::new(RwLock::new(resources))
    }

    #[test]
    fn loop_yields_to_a_newer_generation() {
        let platform = MockPlatform::with_lines(["GPIO6"]);
        let line = platform.line("GPIO6").unwrap();
        let resources = shared("GPIO6", PwmSetting { generation: 2, ..setting(0.5, 100.0) });

        let exit = software_pwm_loop(resources, CancelSignal::new(), "GPIO6".into(), line, 1);

        assert_eq!(exit, LoopExit::Stopped);
        assert!(platform.transitions("GPIO6").is_empty());
    }

    #[test]
    #[traced_test]
    fn pin_failures_are_logged_and_pulsing_continues() {
        let platform = MockPlatform::with_lines(["GPIO5"]);
        let line = platform.line("GPIO5").unwrap();
        line.fail_writes(true);
        let resources = shared("GPIO5", setting(0.5, 200.0));
        let cancel = CancelSignal::new();

        let driver = {
            let cancel = cancel.clone();
            let line = line.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                line.fail_writes(false);
                std::thread::sleep(Duration::from_millis(40));
                cancel.cancel();
            })
        };
        let exit = software_pwm_loop(resources, cancel, "GPIO5".into(), line, 1);
        driver.join().unwrap();

        assert_eq!(exit, LoopExit::Cancelled);
        assert!(logs_contain("error setting pin"));
        assert!(platform.transitions("GPIO5").iter().any(|(high, _)| *high));
    }

    #[test]
    fn zero_frequency_idles_without_toggling() {
        let platform = MockPlatform::with_lines(["GPIO7"]);
        let line = platform.line("GPIO7").unwrap();
        let resources = shared("GPIO7", setting(0.5, 0.0));
        let cancel = CancelSignal::new();

        let driver = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(IDLE_POLL * 3);
                cancel.cancel();
            })
        };
        let exit = software_pwm_loop(resources, cancel, "GPIO7".into(), line, 1);
        driver.join().unwrap();

        assert_eq!(exit, LoopExit::Cancelled);
        assert!(platform.transitions("GPIO7").is_empty());
    }
}
