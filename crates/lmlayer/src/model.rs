//! Model capability and how the worker obtains one.
//!
//! The worker never discovers models through ambient state: it is handed a
//! [`ModelLoader`] at construction and asks it for a model during the handshake.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;

use crate::bridge::protocol::{Configuration, Context, InternalSuggestion, Transform};

/// A loaded prediction model.
pub trait Model: Send + Sync {
    /// Configuration the model declares. Authoritative over what was requested.
    fn configuration(&self) -> Configuration;

    /// Weighted candidates for applying `transform` at `context`. Unordered.
    fn predict(&self, context: &Context, transform: &Transform) -> Vec<InternalSuggestion>;
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no model registered as '{model}'")]
    NotRegistered { model: String },

    #[error("failed to read model {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("model '{model}' failed to initialize: {message}")]
    Factory { model: String, message: String },
}

impl LoadError {
    pub fn factory(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Factory {
            model: model.into(),
            message: message.into(),
        }
    }
}

/// Turns a model identifier plus requested configuration into a model.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(
        &self,
        model: &str,
        configuration: &Configuration,
    ) -> Result<Arc<dyn Model>, LoadError>;
}

pub type ModelFactory =
    Box<dyn Fn(&Configuration) -> Result<Arc<dyn Model>, LoadError> + Send + Sync>;

/// Explicit name-to-factory table.
#[derive(Default)]
pub struct ModelRegistry {
    factories: HashMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Configuration) -> Result<Arc<dyn Model>, LoadError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[async_trait]
impl ModelLoader for ModelRegistry {
    async fn load(
        &self,
        model: &str,
        configuration: &Configuration,
    ) -> Result<Arc<dyn Model>, LoadError> {
        let factory = self
            .factories
            .get(model)
            .ok_or_else(|| LoadError::NotRegistered {
                model: model.to_string(),
            })?;
        tracing::debug!(model, "Instantiating registered model");
        factory(configuration)
    }
}

/// Serves canned suggestion batches, one batch per prediction, cycling.
pub struct DummyModel {
    configuration: Configuration,
    batches: Vec<Vec<InternalSuggestion>>,
    next: AtomicUsize,
}

impl DummyModel {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            batches: Vec::new(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn with_batches(mut self, batches: Vec<Vec<InternalSuggestion>>) -> Self {
        self.batches = batches;
        self
    }
}

impl Model for DummyModel {
    fn configuration(&self) -> Configuration {
        self.configuration.clone()
    }

    fn predict(&self, _context: &Context, _transform: &Transform) -> Vec<InternalSuggestion> {
        if self.batches.is_empty() {
            return Vec::new();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.batches.len();
        self.batches[index].clone()
    }
}

/// On-disk description read by [`FileModelLoader`].
#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default)]
    configuration: Option<Configuration>,
    #[serde(default)]
    suggestions: Vec<Vec<InternalSuggestion>>,
}

/// Loads a [`DummyModel`] from a JSON file named by the model identifier.
///
/// File format: `{"configuration": {...}?, "suggestions": [[InternalSuggestion, ...], ...]}`.
/// Without a `configuration` the model declares the requested one.
#[derive(Debug, Clone, Default)]
pub struct FileModelLoader {
    base_dir: Option<PathBuf>,
}

impl FileModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative model paths against `dir` instead of the working directory.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn resolve(&self, model: &str) -> PathBuf {
        let path = Path::new(model);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl ModelLoader for FileModelLoader {
    async fn load(
        &self,
        model: &str,
        configuration: &Configuration,
    ) -> Result<Arc<dyn Model>, LoadError> {
        let path = self.resolve(model);
        tracing::info!(path = %path.display(), "Loading model");

        let bytes = tokio::fs::read(&path).await.map_err(|source| LoadError::Read {
            path: path.clone(),
            source,
        })?;
        let file: ModelFile =
            serde_json::from_slice(&bytes).map_err(|source| LoadError::Parse {
                path: path.clone(),
                source,
            })?;

        let declared = file
            .configuration
            .unwrap_or_else(|| configuration.clone());
        tracing::debug!(batches = file.suggestions.len(), "Model file parsed");
        Ok(Arc::new(DummyModel::new(declared).with_batches(file.suggestions)))
    }
}
