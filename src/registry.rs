//! Dynamics factory registry.
//!
//! Atomic-model implementations are registered by name, so a project
//! description can bind its atomic models to loadable dynamics without the
//! core knowing any concrete type. The registry owns the factories for the
//! whole simulation; plug-in libraries register on load and are released
//! when the registry drops.
//!
//! # Example
//!
//! ```
//! use veld::registry::DynamicsRegistry;
//! use veld::dynamics::{Dynamics, DynamicsContext};
//! use veld::time::Time;
//! use std::collections::HashMap;
//!
//! struct Passive;
//! impl Dynamics for Passive {
//!     fn time_advance(&self) -> Time {
//!         Time::INFINITY
//!     }
//! }
//!
//! let mut registry = DynamicsRegistry::new();
//! registry.register("passive", |_ctx, _attrs| Box::new(Passive));
//!
//! let ctx = DynamicsContext::new("top.m", veld::rng::SharedRng::seed_from_u64(0));
//! let dynamics = registry.create("passive", ctx, &HashMap::new()).unwrap();
//! assert!(dynamics.time_advance().is_infinite());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::dynamics::{Dynamics, DynamicsContext};

/// Type alias for dynamics factory functions.
pub type DynamicsFactory =
    Arc<dyn Fn(DynamicsContext, &HashMap<String, String>) -> Box<dyn Dynamics> + Send + Sync>;

/// A registry of dynamics factories keyed by plug-in name.
#[derive(Default)]
pub struct DynamicsRegistry {
    factories: HashMap<String, DynamicsFactory>,
}

impl DynamicsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(DynamicsContext, &HashMap<String, String>) -> Box<dyn Dynamics>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiates a dynamics by name.
    ///
    /// Returns `None` when no factory is registered under `name`.
    pub fn create(
        &self,
        name: &str,
        context: DynamicsContext,
        attrs: &HashMap<String, String>,
    ) -> Option<Box<dyn Dynamics>> {
        self.factories.get(name).map(|f| f(context, attrs))
    }

    /// True when a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True when no factory is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Iterates the registered names.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.factories.keys()
    }

    /// Unregisters a factory; `true` when one was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    /// Drops every factory.
    pub fn clear(&mut self) {
        self.factories.clear();
    }
}

impl std::fmt::Debug for DynamicsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicsRegistry")
            .field("registered", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SharedRng;
    use crate::time::Time;

    struct Passive;

    impl Dynamics for Passive {
        fn time_advance(&self) -> Time {
            Time::INFINITY
        }
    }

    fn ctx() -> DynamicsContext {
        DynamicsContext::new("top.m", SharedRng::seed_from_u64(0))
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = DynamicsRegistry::new();
        assert!(registry.is_empty());

        registry.register("passive", |_ctx, _attrs| Box::new(Passive));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("passive"));

        let attrs = HashMap::new();
        assert!(registry.create("passive", ctx(), &attrs).is_some());
        assert!(registry.create("missing", ctx(), &attrs).is_none());
    }

    #[test]
    fn test_factory_reads_attrs() {
        struct Fixed(Time);
        impl Dynamics for Fixed {
            fn time_advance(&self) -> Time {
                self.0
            }
        }

        let mut registry = DynamicsRegistry::new();
        registry.register("fixed", |_ctx, attrs| {
            let period = attrs
                .get("period")
                .and_then(|s| s.parse().ok())
                .and_then(Time::new)
                .unwrap_or(Time::INFINITY);
            Box::new(Fixed(period))
        });

        let attrs = HashMap::from([("period".to_string(), "2.5".to_string())]);
        let dynamics = registry.create("fixed", ctx(), &attrs).unwrap();
        assert_eq!(dynamics.time_advance(), Time::new(2.5).unwrap());
    }

    #[test]
    fn test_unregister() {
        let mut registry = DynamicsRegistry::new();
        registry.register("passive", |_ctx, _attrs| Box::new(Passive));
        assert!(registry.unregister("passive"));
        assert!(!registry.unregister("passive"));
        assert!(!registry.contains("passive"));
    }
}
