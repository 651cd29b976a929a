//! Provider registry: named clients plus a default, resolved per turn
//! from the request's `provider` hint or the `LLM_PROVIDER` environment
//! default.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use wl_domain::{Error, Result};

use crate::LlmClient;

#[derive(Default)]
pub struct ProviderRegistry {
    clients: RwLock<HashMap<String, Arc<dyn LlmClient>>>,
    default_provider: RwLock<Option<String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its name. The first registration becomes
    /// the default unless one was set explicitly.
    pub fn register(&self, name: impl Into<String>, client: Arc<dyn LlmClient>) {
        let name = name.into();
        let mut defaults = self.default_provider.write();
        if defaults.is_none() {
            *defaults = Some(name.clone());
        }
        drop(defaults);
        self.clients.write().insert(name, client);
    }

    pub fn set_default(&self, name: impl Into<String>) {
        *self.default_provider.write() = Some(name.into());
    }

    /// Resolve `provider` (or the default) to a registered client.
    pub fn resolve(&self, provider: Option<&str>) -> Result<Arc<dyn LlmClient>> {
        let name = match provider {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => self
                .default_provider
                .read()
                .clone()
                .ok_or_else(|| Error::llm("no default LLM provider configured"))?,
        };

        self.clients
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::llm(format!("unknown LLM provider '{name}'")))
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedClient;
    use crate::LlmResponse;

    #[test]
    fn first_registration_is_default() {
        let registry = ProviderRegistry::new();
        registry.register("alpha", Arc::new(ScriptedClient::new(vec![])));
        registry.register("beta", Arc::new(ScriptedClient::new(vec![])));

        assert_eq!(registry.resolve(None).unwrap().provider_id(), "scripted");
        assert_eq!(registry.provider_names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn explicit_default_and_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(registry.resolve(None).is_err());

        registry.register(
            "alpha",
            Arc::new(ScriptedClient::new(vec![LlmResponse::text_only("hi")])),
        );
        registry.set_default("alpha");
        assert!(registry.resolve(Some("alpha")).is_ok());
        assert!(registry.resolve(Some("missing")).is_err());
    }
}
