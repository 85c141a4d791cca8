use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::TractConfig;

/// Builds a fresh backend instance. Called once per worker.
pub type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Named backend factories.
///
/// Workers never share a backend; each one asks the registry for its own
/// instance so `detect(&mut self)` needs no lock.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the backends compiled into this build.
    ///
    /// `stub` is always present. `tract` is registered when the
    /// `backend-tract` feature is on and a model path is given.
    pub fn with_builtin(tract: Option<TractConfig>) -> Self {
        let mut registry = Self::new();
        registry.register("stub", || {
            Ok(Box::new(super::StubBackend::new()) as Box<dyn DetectorBackend>)
        });
        if let Some(cfg) = tract {
            register_tract(&mut registry, cfg);
        }
        registry
    }

    /// Register a factory. The first registered name becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!(
                "backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn factory(&self, name: &str) -> Option<BackendFactory> {
        self.factories.get(name).cloned()
    }

    pub fn default_factory(&self) -> Result<BackendFactory> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.factory(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>> {
        let factory = self
            .factory(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        factory()
    }

    pub fn create_default(&self) -> Result<Box<dyn DetectorBackend>> {
        (self.default_factory()?)()
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut BackendRegistry, cfg: TractConfig) {
    registry.register("tract", move || {
        let backend = super::TractBackend::load(&cfg)?;
        Ok(Box::new(backend) as Box<dyn DetectorBackend>)
    });
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(_registry: &mut BackendRegistry, cfg: TractConfig) {
    log::warn!(
        "model {} configured but this build has no tract backend",
        cfg.model_path.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;

    #[test]
    fn first_registration_is_default() {
        let mut registry = BackendRegistry::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>));
        registry.register("other", || Err(anyhow!("not available")));
        assert_eq!(registry.default_name(), Some("stub"));
        assert_eq!(registry.create_default().unwrap().name(), "stub");
        assert!(registry.create("other").is_err());
        assert!(registry.create("missing").is_err());
    }

    #[test]
    fn set_default_rejects_unknown_names() {
        let mut registry = BackendRegistry::with_builtin(None);
        assert!(registry.set_default("nope").is_err());
        assert!(registry.set_default("stub").is_ok());
        assert!(registry.list().contains(&"stub".to_string()));
    }

    #[test]
    fn empty_registry_has_no_default() {
        let registry = BackendRegistry::new();
        assert!(registry.create_default().is_err());
    }
}
