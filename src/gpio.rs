//! GPIO pin handles.
//!
//! A [`GpioPin`] is handed out per lookup and is cheap to create. Digital writes go
//! straight to the line after withdrawing any PWM setting for the pin, which is
//! what stops a running software loop. PWM changes are recorded in the board's
//! settings map; pins with a hardware generator are programmed directly, every
//! other pin gets a software loop on its first PWM change.
//!
//! Settings are keyed by the global line a pin resolves to, so two spellings of the
//! same pin (`"7"` and `"07"` on a mapped board) share one setting and one loop.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{BoardError, BoardResult};
use crate::platform::GpioLine;
use crate::pwm::{self, CancelSignal, PwmSetting};
use crate::registry::Resources;

/// Handle to one resolved pin of a board.
#[derive(Clone)]
pub struct GpioPin {
    pin: String,
    line: Arc<dyn GpioLine>,
    hw_pwm_supported: bool,
    resources: Arc<RwLock<Resources>>,
    cancel: CancelSignal,
}

impl std::fmt::Debug for GpioPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpioPin")
            .field("pin", &self.pin)
            .field("line", &self.line.name())
            .field("hw_pwm_supported", &self.hw_pwm_supported)
            .finish()
    }
}

/// Which part of the setting a PWM call changes.
enum PwmUpdate {
    Duty(f64),
    Frequency(f64),
    Both(f64, f64),
}

impl GpioPin {
    pub(crate) fn new(
        pin: impl Into<String>,
        line: Arc<dyn GpioLine>,
        hw_pwm_supported: bool,
        resources: Arc<RwLock<Resources>>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            pin: pin.into(),
            line,
            hw_pwm_supported,
            resources,
            cancel,
        }
    }

    /// Identifier the pin was looked up by.
    pub fn pin(&self) -> &str {
        &self.pin
    }

    /// Whether a hardware PWM generator drives this pin.
    pub fn hw_pwm_supported(&self) -> bool {
        self.hw_pwm_supported
    }

    /// Drive the pin, withdrawing any PWM output first.
    pub async fn set(&self, high: bool) -> BoardResult<()> {
        let mut resources = self.resources.write().await;
        if resources.closed {
            return Err(BoardError::Closed("board".into()));
        }
        if resources.pwms.remove(self.key()).is_some() {
            debug!(pin = %self.pin, "pwm withdrawn by digital write");
            if self.hw_pwm_supported {
                self.line.set_hardware_pwm(0.0, 0.0)?;
            }
        }
        self.line.set_level(high)
    }

    /// Current line level.
    pub async fn get(&self) -> BoardResult<bool> {
        self.line.level()
    }

    /// Current duty cycle, zero when not pulsing.
    pub async fn pwm(&self) -> f64 {
        self.setting().await.map(|s| s.duty_cycle).unwrap_or(0.0)
    }

    /// Current PWM frequency, zero when not pulsing.
    pub async fn pwm_freq(&self) -> f64 {
        self.setting().await.map(|s| s.frequency_hz).unwrap_or(0.0)
    }

    /// Change the duty cycle, keeping the frequency.
    pub async fn set_pwm(&self, duty_cycle: f64) -> BoardResult<()> {
        pwm::validate_duty_cycle(duty_cycle)?;
        self.update(PwmUpdate::Duty(duty_cycle)).await
    }

    /// Change the frequency, keeping the duty cycle.
    pub async fn set_pwm_freq(&self, frequency_hz: f64) -> BoardResult<()> {
        pwm::validate_frequency(frequency_hz)?;
        self.update(PwmUpdate::Frequency(frequency_hz)).await
    }

    /// Set duty cycle and frequency together.
    pub async fn set_pulse(&self, duty_cycle: f64, frequency_hz: f64) -> BoardResult<()> {
        pwm::validate_duty_cycle(duty_cycle)?;
        pwm::validate_frequency(frequency_hz)?;
        self.update(PwmUpdate::Both(duty_cycle, frequency_hz)).await
    }

    fn key(&self) -> &str {
        self.line.name()
    }

    async fn setting(&self) -> Option<PwmSetting> {
        self.resources.read().await.pwms.get(self.key()).copied()
    }

    async fn update(&self, change: PwmUpdate) -> BoardResult<()> {
        let mut guard = self.resources.write().await;
        if guard.closed {
            return Err(BoardError::Closed("board".into()));
        }

        let existing = guard.pwms.get(self.key()).copied();
        let mut setting = existing.unwrap_or(PwmSetting {
            duty_cycle: 0.0,
            frequency_hz: 0.0,
            generation: 0,
        });
        match change {
            PwmUpdate::Duty(duty) => setting.duty_cycle = duty,
            PwmUpdate::Frequency(freq) => setting.frequency_hz = freq,
            PwmUpdate::Both(duty, freq) => {
                setting.duty_cycle = duty;
                setting.frequency_hz = freq;
            }
        }

        if self.hw_pwm_supported {
            // A zero frequency stops the generator.
            self.line
                .set_hardware_pwm(setting.duty_cycle, setting.frequency_hz)?;
            guard.pwms.insert(self.key().to_string(), setting);
            return Ok(());
        }

        if existing.is_some() {
            guard.pwms.insert(self.key().to_string(), setting);
            return Ok(());
        }

        setting.generation = guard.claim_generation();
        guard.pwms.insert(self.key().to_string(), setting);
        pwm::start_software_pwm_loop(
            &mut *guard,
            &self.resources,
            &self.cancel,
            &self.pin,
            self.line.clone(),
            setting.generation,
        );
        debug!(pin = %self.pin, generation = setting.generation, "started software PWM loop");
        Ok(())
    }
}
