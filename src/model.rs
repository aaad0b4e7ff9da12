//! Board models.
//!
//! A model captures what differs between board variants: the pin numbering map and
//! which resource kinds the hardware can expose. Boards are built from a model plus
//! an already-parsed [`BoardConfig`](crate::config::BoardConfig); a [`ModelRegistry`]
//! lets a host pick the model by name without knowing how it is put together.

use std::collections::{BTreeMap, HashMap};

use crate::error::{BoardError, BoardResult};
use crate::pins::GpioBoardMapping;

/// Name of the built-in model that addresses lines by global name.
pub const PERIPH_MODEL: &str = "periph";

/// Static description of a board variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardModel {
    /// Model name
    pub name: String,
    /// Pin number → line map; `None` means pins are global line names
    pub gpio_mappings: Option<BTreeMap<u32, GpioBoardMapping>>,
    /// Whether digital interrupts can be configured
    pub supports_digital_interrupts: bool,
}

impl BoardModel {
    /// Lines addressed by global name, no digital interrupts.
    pub fn periph() -> Self {
        Self {
            name: PERIPH_MODEL.to_string(),
            gpio_mappings: None,
            supports_digital_interrupts: false,
        }
    }

    /// A model with a pin numbering map.
    pub fn with_mappings(name: impl Into<String>, mappings: BTreeMap<u32, GpioBoardMapping>) -> Self {
        Self {
            name: name.into(),
            gpio_mappings: Some(mappings),
            supports_digital_interrupts: false,
        }
    }

    /// Allow digital interrupts on this model.
    pub fn with_digital_interrupts(mut self) -> Self {
        self.supports_digital_interrupts = true;
        self
    }
}

/// Models available to a host, by name.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, BoardModel>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self {
            models: HashMap::new(),
        };
        registry.register(BoardModel::periph());
        registry
    }
}

impl ModelRegistry {
    /// Registry holding the built-in models.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a model.
    pub fn register(&mut self, model: BoardModel) {
        self.models.insert(model.name.clone(), model);
    }

    /// Look a model up by name.
    pub fn get(&self, name: &str) -> BoardResult<&BoardModel> {
        self.models
            .get(name)
            .ok_or_else(|| BoardError::validation("board.model", format!("unknown board model \"{}\"", name)))
    }

    /// Registered model names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periph_is_built_in() {
        let registry = ModelRegistry::new();
        let model = registry.get(PERIPH_MODEL).unwrap();
        assert!(model.gpio_mappings.is_none());
        assert!(!model.supports_digital_interrupts);
    }

    #[test]
    fn unknown_model_is_a_validation_error() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.get("beaglebone"),
            Err(BoardError::Validation { .. })
        ));
    }

    #[test]
    fn custom_models_can_be_registered() {
        let mut registry = ModelRegistry::new();
        registry.register(BoardModel::with_mappings("pi-header", BTreeMap::new()).with_digital_interrupts());
        assert_eq!(registry.names(), vec!["periph", "pi-header"]);
        assert!(registry.get("pi-header").unwrap().supports_digital_interrupts);
    }
}
