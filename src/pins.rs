//! Pin resolution.
//!
//! Callers address pins by identifier. On boards without a numbering map the
//! identifier is a global line name and is looked up directly. Boards with a map
//! (header pin numbers, for instance) translate the number to the global line first;
//! only mapped pins can report hardware PWM support.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BoardError, BoardResult};
use crate::platform::{GpioLine, Platform};

/// Where one board pin number lands on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpioBoardMapping {
    /// GPIO chip device the line belongs to (informational)
    #[serde(default)]
    pub gpio_chip: String,
    /// Line offset within that chip (informational)
    #[serde(default)]
    pub line_offset: u32,
    /// Global line number used for lookup
    pub gpio_global: u32,
    /// Whether a hardware PWM generator can drive this pin
    #[serde(default)]
    pub hw_pwm_supported: bool,
}

/// Result of resolving a pin identifier.
#[derive(Clone)]
pub struct ResolvedPin {
    /// The backing line
    pub line: Arc<dyn GpioLine>,
    /// Whether hardware PWM is available for it
    pub hw_pwm_supported: bool,
}

/// Resolves pin identifiers against an optional numbering map.
pub struct PinResolver {
    mappings: Option<BTreeMap<u32, GpioBoardMapping>>,
    platform: Arc<dyn Platform>,
}

impl PinResolver {
    /// Resolver over `platform`, translating through `mappings` when given.
    pub fn new(mappings: Option<BTreeMap<u32, GpioBoardMapping>>, platform: Arc<dyn Platform>) -> Self {
        Self { mappings, platform }
    }

    /// Find the line behind `pin`.
    pub fn resolve(&self, pin: &str) -> BoardResult<ResolvedPin> {
        let (global_name, hw_pwm_supported) = match &self.mappings {
            None => (pin.to_string(), false),
            Some(mappings) => {
                let number: u32 = pin
                    .trim()
                    .parse()
                    .map_err(|_| BoardError::InvalidPin(pin.to_string()))?;
                let mapping = mappings
                    .get(&number)
                    .ok_or_else(|| BoardError::InvalidPin(pin.to_string()))?;
                (mapping.gpio_global.to_string(), mapping.hw_pwm_supported)
            }
        };

        let line = self
            .platform
            .gpio_line(&global_name)
            .ok_or(BoardError::PinNotFound(global_name))?;
        Ok(ResolvedPin {
            line,
            hw_pwm_supported,
        })
    }

    /// Mapped pin numbers, ascending. Empty without a map.
    pub fn pin_names(&self) -> Vec<String> {
        self.mappings
            .as_ref()
            .map(|m| m.keys().map(|k| k.to_string()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;

    fn mapped_resolver() -> PinResolver {
        let platform = Arc::new(MockPlatform::new());
        platform.add_line("17", false);
        platform.add_line("18", true);
        let mut mappings = BTreeMap::new();
        mappings.insert(
            11,
            GpioBoardMapping {
                gpio_chip: "gpiochip0".into(),
                line_offset: 17,
                gpio_global: 17,
                hw_pwm_supported: false,
            },
        );
        mappings.insert(
            12,
            GpioBoardMapping {
                gpio_chip: "gpiochip0".into(),
                line_offset: 18,
                gpio_global: 18,
                hw_pwm_supported: true,
            },
        );
        mappings.insert(
            40,
            GpioBoardMapping {
                gpio_chip: "gpiochip0".into(),
                line_offset: 21,
                gpio_global: 21,
                hw_pwm_supported: false,
            },
        );
        PinResolver::new(Some(mappings), platform)
    }

    #[test]
    fn direct_lookup_without_map() {
        let platform = Arc::new(MockPlatform::with_lines(["GPIO4"]));
        let resolver = PinResolver::new(None, platform);
        let pin = resolver.resolve("GPIO4").unwrap();
        assert_eq!(pin.line.name(), "GPIO4");
        assert!(!pin.hw_pwm_supported);
        assert!(matches!(resolver.resolve("GPIO5"), Err(BoardError::PinNotFound(_))));
        assert!(resolver.pin_names().is_empty());
    }

    #[test]
    fn mapped_lookup_translates_numbers() {
        let resolver = mapped_resolver();
        let pin = resolver.resolve("12").unwrap();
        assert_eq!(pin.line.name(), "18");
        assert!(pin.hw_pwm_supported);
        assert_eq!(resolver.pin_names(), vec!["11", "12", "40"]);
    }

    #[test]
    fn mapped_lookup_failures() {
        let resolver = mapped_resolver();
        assert!(matches!(resolver.resolve("abc"), Err(BoardError::InvalidPin(_))));
        assert!(matches!(resolver.resolve("3"), Err(BoardError::InvalidPin(_))));
        match resolver.resolve("40") {
            Err(BoardError::PinNotFound(name)) => assert_eq!(name, "21"),
            _ => panic!("expected PinNotFound"),
        }
    }
}
