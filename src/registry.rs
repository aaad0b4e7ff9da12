//! Per-board resource registry.
//!
//! Everything a board owns lives in one [`Resources`] value behind a single
//! `tokio::sync::RwLock`: the named bus, analog and interrupt handles, the PWM
//! settings that software loops poll, and the join handles of those loops.
//! Reconfiguration holds the write side for a whole call; lookups and each pulse
//! loop iteration take the read side.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::analog::AnalogChannel;
use crate::bus::{I2cBus, SpiBus};
use crate::interrupt::DigitalInterrupt;
use crate::pwm::{LoopExit, PwmSetting};

/// Live resources of one board.
pub(crate) struct Resources {
    pub spis: HashMap<String, Arc<SpiBus>>,
    pub i2cs: HashMap<String, Arc<I2cBus>>,
    pub analogs: HashMap<String, Arc<AnalogChannel>>,
    pub digital_interrupts: HashMap<String, Arc<DigitalInterrupt>>,
    /// Keyed by global line name
    pub pwms: HashMap<String, PwmSetting>,
    pub pwm_workers: JoinSet<LoopExit>,
    pub next_generation: u64,
    pub closed: bool,
}

impl Resources {
    pub fn new() -> Self {
        Self {
            spis: HashMap::new(),
            i2cs: HashMap::new(),
            analogs: HashMap::new(),
            digital_interrupts: HashMap::new(),
            pwms: HashMap::new(),
            pwm_workers: JoinSet::new(),
            next_generation: 0,
            closed: false,
        }
    }

    /// Generation number for a newly spawned pulse loop.
    pub fn claim_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Drop join handles of loops that already exited.
    pub fn reap_finished_workers(&mut self) {
        while let Some(result) = self.pwm_workers.try_join_next() {
            if let Err(e) = result {
                tracing::warn!(error = %e, "software PWM loop panicked");
            }
        }
    }
}

/// Keys of `map`, sorted.
pub(crate) fn sorted_names<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}
