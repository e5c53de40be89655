//! Host-side configuration: which model to load, what to ask it for, and how
//! to start the worker.
//!
//! Environment:
//! - `LMLAYER_MODEL`: model identifier sent in the handshake (required)
//! - `LMLAYER_WORKER_BIN`: worker executable, default `lmlayer-worker`

use std::sync::Arc;

use crate::bridge::protocol::Configuration;
use crate::client::{ClientError, InitializeParams, LMLayer};
use crate::spawner::{DEFAULT_WORKER_PROGRAM, ProcessSpawner, SpawnError, WorkerSpawner};

pub const MODEL_ENV: &str = "LMLAYER_MODEL";
pub const WORKER_BIN_ENV: &str = "LMLAYER_WORKER_BIN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LMLAYER_MODEL is not set")]
    MissingModel,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("initialize failed: {0}")]
    Initialize(#[from] ClientError),
}

pub struct LMLayerConfig {
    pub model: String,
    pub configuration: Option<Configuration>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl LMLayerConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            configuration: None,
            spawner: Arc::new(ProcessSpawner::default()),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let model = lookup(MODEL_ENV)
            .filter(|m| !m.is_empty())
            .ok_or(ConfigError::MissingModel)?;
        let program = lookup(WORKER_BIN_ENV).unwrap_or_else(|| DEFAULT_WORKER_PROGRAM.to_string());
        Ok(Self::new(model).with_spawner(Arc::new(ProcessSpawner::new(program))))
    }

    /// Overrides merged into the requested defaults.
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn initialize_params(&self) -> InitializeParams {
        InitializeParams {
            model: self.model.clone(),
            configuration: self.configuration.clone(),
        }
    }

    /// Spawn the worker and complete the handshake.
    pub async fn connect(&self) -> Result<(LMLayer, Configuration), ConfigError> {
        let lm = LMLayer::spawn(self.spawner.as_ref())?;
        tracing::info!(model = %self.model, "Connecting to worker");
        let configuration = lm.initialize(self.initialize_params()).await?;
        Ok((lm, configuration))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::bridge::protocol::{Context, Transform};
    use crate::client::PredictParams;
    use crate::model::{DummyModel, Model, ModelRegistry};
    use crate::spawner::InProcessSpawner;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn from_env_requires_model() {
        let err = LMLayerConfig::from_lookup(lookup(&[])).err().unwrap();
        assert!(matches!(err, ConfigError::MissingModel));
        insta::assert_snapshot!(err.to_string(), @"LMLAYER_MODEL is not set");

        let err = LMLayerConfig::from_lookup(lookup(&[(MODEL_ENV, "")]))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingModel));
    }

    #[test]
    fn from_env_reads_model() {
        let config = LMLayerConfig::from_lookup(lookup(&[
            (MODEL_ENV, "models/en.json"),
            (WORKER_BIN_ENV, "/opt/lmlayer/worker"),
        ]))
        .unwrap();
        assert_eq!(config.model, "models/en.json");
        assert!(config.configuration.is_none());
    }

    #[test]
    fn initialize_params_carry_overrides() {
        let config = LMLayerConfig::new("m")
            .with_configuration(Configuration::new().with("maxLeftContextCodeUnits", 8));
        let params = config.initialize_params();

        insta::assert_json_snapshot!(params.requested_configuration(), @r#"
        {
          "maxLeftContextCodeUnits": 8,
          "supportsRightContexts": false
        }
        "#);
    }

    #[tokio::test]
    async fn connect_completes_handshake() {
        let loader = ModelRegistry::new().register("dummy", |_: &Configuration| {
            Ok(Arc::new(DummyModel::new(Configuration::new().with("leftContextCodeUnits", 5)))
                as Arc<dyn Model>)
        });
        let config = LMLayerConfig::new("dummy")
            .with_spawner(Arc::new(InProcessSpawner::new(Arc::new(loader))));

        let (lm, configuration) = config.connect().await.unwrap();
        assert_eq!(configuration.left_context_code_units(), Some(5));

        let reply = lm
            .predict(PredictParams::new(Transform::insert("a"), Context::left("")))
            .await
            .unwrap();
        assert!(reply.suggestions.is_empty());
    }
}
