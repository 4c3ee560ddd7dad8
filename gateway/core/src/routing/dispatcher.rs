//! Model dispatcher
//!
//! Maps a requested model id to the backend built for it at startup.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::info;

use crate::backend::{Backend, BackendError, LlmBackend};
use crate::config::GatewayConfig;

/// Dispatcher errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The model id is not configured
    #[error("Unsupported model: {0}")]
    ModelNotFound(String),

    /// A configured backend could not be built
    #[error("Failed to build backend for model '{model}': {source}")]
    BackendInit {
        /// Model whose backend failed
        model: String,
        /// Underlying error
        source: BackendError,
    },
}

impl From<DispatchError> for BackendError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::ModelNotFound(model) => {
                BackendError::not_found(format!("Unsupported model: {model}"))
            }
            DispatchError::BackendInit { source, .. } => source,
        }
    }
}

/// A configured model as listed to clients
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelEntry {
    /// Model id clients send
    pub id: String,
    /// Backend kind serving it
    pub kind: String,
}

/// Read-only table of model id to backend
#[derive(Debug)]
pub struct Dispatcher {
    backends: BTreeMap<String, Backend>,
}

impl Dispatcher {
    /// Build one backend per configured model
    pub fn from_config(config: &GatewayConfig) -> Result<Self, DispatchError> {
        let mut backends = BTreeMap::new();
        for (model, backend_config) in &config.models {
            let backend =
                Backend::from_config(backend_config).map_err(|source| DispatchError::BackendInit {
                    model: model.clone(),
                    source,
                })?;
            info!(model = %model, backend = backend.name(), "Registered model");
            backends.insert(model.clone(), backend);
        }
        Ok(Self { backends })
    }

    /// Build from already constructed backends
    #[must_use]
    pub fn from_backends(backends: impl IntoIterator<Item = (String, Backend)>) -> Self {
        Self {
            backends: backends.into_iter().collect(),
        }
    }

    /// Look up the backend for `model`
    pub fn resolve(&self, model: &str) -> Result<&Backend, DispatchError> {
        self.backends
            .get(model)
            .ok_or_else(|| DispatchError::ModelNotFound(model.to_string()))
    }

    /// Configured models, sorted by id
    #[must_use]
    pub fn models(&self) -> Vec<ModelEntry> {
        self.backends
            .iter()
            .map(|(id, backend)| ModelEntry {
                id: id.clone(),
                kind: backend.name().to_string(),
            })
            .collect()
    }

    /// Number of configured models
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no models are configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::{BackendErrorKind, EchoBackend};
    use crate::routing::config::{BackendConfig, PooledConfig};

    #[test]
    fn test_resolve_configured_model() {
        let dispatcher = Dispatcher::from_config(&GatewayConfig::default()).unwrap();

        let backend = tokio_test::assert_ok!(dispatcher.resolve("echo-test"));
        assert_eq!(backend.name(), "echo");
    }

    #[test]
    fn test_unknown_model() {
        let dispatcher = Dispatcher::from_config(&GatewayConfig::default()).unwrap();

        let err = tokio_test::assert_err!(dispatcher.resolve("gpt-9"));
        assert_eq!(err.to_string(), "Unsupported model: gpt-9");

        let backend_err: BackendError = err.into();
        assert_eq!(backend_err.kind, BackendErrorKind::NotFound);
    }

    #[test]
    fn test_models_sorted_with_kind() {
        let mut config = GatewayConfig::default();
        config.models.insert(
            "a-local".to_string(),
            BackendConfig::Pooled(PooledConfig::new("127.0.0.1", 10001, "qwen")),
        );

        let dispatcher = Dispatcher::from_config(&config).unwrap();

        assert_eq!(
            dispatcher.models(),
            vec![
                ModelEntry {
                    id: "a-local".to_string(),
                    kind: "pooled".to_string()
                },
                ModelEntry {
                    id: "echo-test".to_string(),
                    kind: "echo".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_from_backends() {
        let dispatcher =
            Dispatcher::from_backends([("e".to_string(), Backend::Echo(EchoBackend::new()))]);
        assert_eq!(dispatcher.len(), 1);
        assert!(!dispatcher.is_empty());
    }
}
