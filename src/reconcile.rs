//! Reconciliation of live resources against a new configuration.
//!
//! Every resource kind is reconciled by the same three-phase routine,
//! [`reconcile_by_key`]:
//!
//! 1. collect the names present in the incoming descriptor list
//! 2. for each descriptor, create the resource if the name is new, otherwise let
//!    the kind update it in place (a no-op when nothing it depends on changed)
//! 3. close and remove every resource whose name is no longer present
//!
//! An error in phase 2 aborts the call immediately. Resources touched earlier in the
//! same call stay as they are and phase 3 does not run; the caller sees the error
//! and is expected to send a corrected configuration.
//!
//! Close failures in phase 3 are logged; the name is removed regardless.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::analog::{self, AnalogChannel};
use crate::bus::{I2cBus, SpiBus};
use crate::config::{AnalogConfig, DigitalInterruptConfig, I2cConfig, SpiConfig};
use crate::error::{BoardError, BoardResult};
use crate::interrupt::DigitalInterrupt;
use crate::pins::PinResolver;
use crate::platform::Platform;

/// Operations the reconcile routine needs from one resource kind.
#[async_trait]
pub trait ResourceKind: Send + Sync {
    /// Live handle type stored in the registry
    type Resource: Send + Sync;
    /// Config descriptor type
    type Descriptor: Send + Sync;

    /// Kind label for log output.
    fn label(&self) -> &'static str;

    /// Name of the resource a descriptor describes.
    fn name<'d>(&self, descriptor: &'d Self::Descriptor) -> &'d str;

    /// Build a resource for a new name.
    async fn create(&self, descriptor: &Self::Descriptor) -> BoardResult<Arc<Self::Resource>>;

    /// Bring an existing resource in line with `descriptor` without replacing it.
    async fn update(&self, current: &Self::Resource, descriptor: &Self::Descriptor) -> BoardResult<Change>;

    /// Release a resource that is being removed.
    async fn close(&self, resource: &Self::Resource) -> BoardResult<()>;
}

/// Outcome of updating one existing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Already matched its descriptor
    Unchanged,
    /// Reset in place
    Reset,
    /// A reset was attempted and failed; the name stays registered and the next
    /// pass tries again
    ResetFailed,
}

/// What one reconcile pass did, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Newly created
    pub added: Vec<String>,
    /// Reset in place
    pub updated: Vec<String>,
    /// Left untouched
    pub unchanged: Vec<String>,
    /// Reset attempted but failed (logged)
    pub failed: Vec<String>,
    /// Closed and removed
    pub removed: Vec<String>,
}

impl ReconcileReport {
    /// Whether the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.failed.is_empty()
            && self.removed.is_empty()
    }
}

/// Make `current` match `desired`.
pub async fn reconcile_by_key<K: ResourceKind>(
    kind: &K,
    current: &mut HashMap<String, Arc<K::Resource>>,
    desired: &[K::Descriptor],
) -> BoardResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut still_exists = HashSet::new();

    for descriptor in desired {
        let name = kind.name(descriptor);
        still_exists.insert(name.to_string());

        match current.get(name) {
            Some(existing) => {
                match kind.update(existing, descriptor).await? {
                    Change::Unchanged => report.unchanged.push(name.to_string()),
                    Change::Reset => {
                        debug!(kind = kind.label(), name, "reset in place");
                        report.updated.push(name.to_string());
                    }
                    Change::ResetFailed => report.failed.push(name.to_string()),
                }
            }
            None => {
                let resource = kind.create(descriptor).await?;
                debug!(kind = kind.label(), name, "created");
                current.insert(name.to_string(), resource);
                report.added.push(name.to_string());
            }
        }
    }

    let removed: Vec<String> = current
        .keys()
        .filter(|name| !still_exists.contains(*name))
        .cloned()
        .collect();
    for name in removed {
        if let Some(resource) = current.remove(&name) {
            if let Err(e) = kind.close(&resource).await {
                warn!(kind = kind.label(), name = %name, error = %e, "error closing resource while reconfiguring");
            }
            debug!(kind = kind.label(), name = %name, "removed");
            report.removed.push(name);
        }
    }

    if !report.is_noop() {
        info!(
            kind = kind.label(),
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "reconciled"
        );
    }
    Ok(report)
}

// =============================================================================
// Kinds
// =============================================================================

/// SPI buses: re-pointed in place when the bus index changes.
pub(crate) struct SpiKind {
    pub platform: Arc<dyn Platform>,
}

#[async_trait]
impl ResourceKind for SpiKind {
    type Resource = SpiBus;
    type Descriptor = SpiConfig;

    fn label(&self) -> &'static str {
        "spi"
    }

    fn name<'d>(&self, descriptor: &'d SpiConfig) -> &'d str {
        &descriptor.name
    }

    async fn create(&self, descriptor: &SpiConfig) -> BoardResult<Arc<SpiBus>> {
        let bus = descriptor.bus_index()?;
        Ok(Arc::new(SpiBus::new(&descriptor.name, bus, self.platform.clone())))
    }

    async fn update(&self, current: &SpiBus, descriptor: &SpiConfig) -> BoardResult<Change> {
        let bus = descriptor.bus_index()?;
        if current.bus_index() == bus {
            return Ok(Change::Unchanged);
        }
        current.reset(bus);
        Ok(Change::Reset)
    }

    async fn close(&self, resource: &SpiBus) -> BoardResult<()> {
        resource.close()
    }
}

/// I2C buses: the adapter is closed and reopened in place when the bus changes.
pub(crate) struct I2cKind {
    pub platform: Arc<dyn Platform>,
}

#[async_trait]
impl ResourceKind for I2cKind {
    type Resource = I2cBus;
    type Descriptor = I2cConfig;

    fn label(&self) -> &'static str {
        "i2c"
    }

    fn name<'d>(&self, descriptor: &'d I2cConfig) -> &'d str {
        &descriptor.name
    }

    async fn create(&self, descriptor: &I2cConfig) -> BoardResult<Arc<I2cBus>> {
        let bus = descriptor.bus_number()?;
        Ok(Arc::new(I2cBus::open(&descriptor.name, bus, self.platform.clone())?))
    }

    async fn update(&self, current: &I2cBus, descriptor: &I2cConfig) -> BoardResult<Change> {
        let bus = descriptor.bus_number()?;
        // A bus whose last reopen failed has no adapter; retry even if the number
        // is unchanged.
        if current.bus_number() == bus && current.is_open() {
            return Ok(Change::Unchanged);
        }
        // The name stays registered even if the new adapter fails to open.
        if let Err(e) = current.reset(bus) {
            warn!(i2c = %descriptor.name, bus, error = %e, "error resetting I2C bus while reconfiguring");
            return Ok(Change::ResetFailed);
        }
        Ok(Change::Reset)
    }

    async fn close(&self, resource: &I2cBus) -> BoardResult<()> {
        resource.close()
    }
}

/// Analog channels: depend on an SPI bus configured on the same board.
pub(crate) struct AnalogKind<'a> {
    pub spis: &'a HashMap<String, Arc<SpiBus>>,
}

impl AnalogKind<'_> {
    fn bus_for(&self, descriptor: &AnalogConfig) -> BoardResult<Arc<SpiBus>> {
        self.spis.get(&descriptor.spi_bus).cloned().ok_or_else(|| {
            BoardError::validation(
                format!("analogs.{}.spi_bus", descriptor.name),
                format!(
                    "can't find SPI bus ({}) requested by analog reader",
                    descriptor.spi_bus
                ),
            )
        })
    }
}

#[async_trait]
impl<'a> ResourceKind for AnalogKind<'a> {
    type Resource = AnalogChannel;
    type Descriptor = AnalogConfig;

    fn label(&self) -> &'static str {
        "analog"
    }

    fn name<'d>(&self, descriptor: &'d AnalogConfig) -> &'d str {
        &descriptor.name
    }

    async fn create(&self, descriptor: &AnalogConfig) -> BoardResult<Arc<AnalogChannel>> {
        let bus = self.bus_for(descriptor)?;
        let reader = analog::smoothed_mcp3008(descriptor, bus.clone())?;
        Ok(Arc::new(AnalogChannel::from_config(descriptor, bus, reader)))
    }

    async fn update(&self, current: &AnalogChannel, descriptor: &AnalogConfig) -> BoardResult<Change> {
        // Dependencies are checked even for unchanged channels.
        let bus = self.bus_for(descriptor)?;
        descriptor.channel()?;
        if current.matches(descriptor, &bus).await {
            return Ok(Change::Unchanged);
        }
        let reader = analog::smoothed_mcp3008(descriptor, bus.clone())?;
        current.replace(descriptor, bus, reader).await;
        Ok(Change::Reset)
    }

    async fn close(&self, resource: &AnalogChannel) -> BoardResult<()> {
        resource.close().await;
        Ok(())
    }
}

/// Digital interrupts: re-bound in place when the pin changes.
pub(crate) struct DigitalInterruptKind<'a> {
    pub resolver: &'a PinResolver,
}

#[async_trait]
impl<'a> ResourceKind for DigitalInterruptKind<'a> {
    type Resource = DigitalInterrupt;
    type Descriptor = DigitalInterruptConfig;

    fn label(&self) -> &'static str {
        "digital_interrupt"
    }

    fn name<'d>(&self, descriptor: &'d DigitalInterruptConfig) -> &'d str {
        &descriptor.name
    }

    async fn create(&self, descriptor: &DigitalInterruptConfig) -> BoardResult<Arc<DigitalInterrupt>> {
        let resolved = self.resolver.resolve(&descriptor.pin)?;
        Ok(Arc::new(DigitalInterrupt::new(
            &descriptor.name,
            &descriptor.pin,
            resolved.line,
        )))
    }

    async fn update(
        &self,
        current: &DigitalInterrupt,
        descriptor: &DigitalInterruptConfig,
    ) -> BoardResult<Change> {
        if current.pin() == descriptor.pin {
            return Ok(Change::Unchanged);
        }
        let resolved = self.resolver.resolve(&descriptor.pin)?;
        current.reset(&descriptor.pin, resolved.line);
        Ok(Change::Reset)
    }

    async fn close(&self, resource: &DigitalInterrupt) -> BoardResult<()> {
        resource.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    /// Counter resources keyed by name; the descriptor is `(name, value)`.
    #[derive(Default)]
    struct Counters {
        closes: AtomicUsize,
        fail_close: bool,
        fail_on: Option<&'static str>,
    }

    struct Counter {
        value: parking_lot::Mutex<u32>,
    }

    #[async_trait]
    impl ResourceKind for Counters {
        type Resource = Counter;
        type Descriptor = (&'static str, u32);

        fn label(&self) -> &'static str {
            "counter"
        }

        fn name<'d>(&self, descriptor: &'d (&'static str, u32)) -> &'d str {
            descriptor.0
        }

        async fn create(&self, descriptor: &(&'static str, u32)) -> BoardResult<Arc<Counter>> {
            if self.fail_on == Some(descriptor.0) {
                return Err(BoardError::validation(descriptor.0, "rejected"));
            }
            Ok(Arc::new(Counter {
                value: parking_lot::Mutex::new(descriptor.1),
            }))
        }

        async fn update(&self, current: &Counter, descriptor: &(&'static str, u32)) -> BoardResult<Change> {
            let mut value = current.value.lock();
            if *value == descriptor.1 {
                return Ok(Change::Unchanged);
            }
            *value = descriptor.1;
            Ok(Change::Reset)
        }

        async fn close(&self, _resource: &Counter) -> BoardResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(BoardError::Hardware("close failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn adds_updates_and_removes() {
        let kind = Counters::default();
        let mut map = HashMap::new();

        let report = reconcile_by_key(&kind, &mut map, &[("a", 1), ("b", 2)]).await.unwrap();
        assert_eq!(report.added, vec!["a", "b"]);
        let a = map["a"].clone();

        let report = reconcile_by_key(&kind, &mut map, &[("a", 5), ("c", 3)]).await.unwrap();
        assert_eq!(report.updated, vec!["a"]);
        assert_eq!(report.added, vec!["c"]);
        assert_eq!(report.removed, vec!["b"]);
        assert!(Arc::ptr_eq(&a, &map["a"]));
        assert_eq!(*a.value.lock(), 5);
        assert_eq!(kind.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identical_input_is_a_noop() {
        let kind = Counters::default();
        let mut map = HashMap::new();
        reconcile_by_key(&kind, &mut map, &[("a", 1)]).await.unwrap();
        let report = reconcile_by_key(&kind, &mut map, &[("a", 1)]).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(report.unchanged, vec!["a"]);
    }

    #[tokio::test]
    async fn error_keeps_earlier_mutations_and_skips_removal() {
        let kind = Counters {
            fail_on: Some("bad"),
            ..Default::default()
        };
        let mut map = HashMap::new();
        reconcile_by_key(&kind, &mut map, &[("a", 1), ("old", 9)]).await.unwrap();

        let err = reconcile_by_key(&kind, &mut map, &[("a", 2), ("new", 3), ("bad", 0)])
            .await
            .unwrap_err();

        assert!(matches!(err, BoardError::Validation { .. }));
        assert_eq!(*map["a"].value.lock(), 2);
        assert!(map.contains_key("new"));
        assert!(map.contains_key("old"));
        assert!(!map.contains_key("bad"));
    }

    #[tokio::test]
    #[traced_test]
    async fn close_failure_still_removes() {
        let kind = Counters {
            fail_close: true,
            ..Default::default()
        };
        let mut map = HashMap::new();
        reconcile_by_key(&kind, &mut map, &[("a", 1)]).await.unwrap();

        let report = reconcile_by_key(&kind, &mut map, &[]).await.unwrap();

        assert_eq!(report.removed, vec!["a"]);
        assert!(map.is_empty());
        assert!(logs_contain("error closing resource while reconfiguring"));
    }
}
