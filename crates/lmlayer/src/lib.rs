//! lmlayer: asynchronous host/worker bridge for predictive-text models.
//!
//! The host talks to a model only through messages. [`LMLayer`] is the host
//! proxy; [`worker`] holds the worker side, which loads a model on `initialize`
//! and answers `predict` with ranked suggestions.

pub mod bridge;
pub mod client;
pub mod config;
pub mod logging;
pub mod model;
pub mod pending;
pub mod spawner;
pub mod token;
pub mod worker;

/// Crate version from Cargo.toml.
pub const LMLAYER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::protocol::{
    Configuration, Context, InternalSuggestion, Message, Suggestion, Token, Transform,
};
pub use client::{
    ClientError, InitializeParams, LMLayer, PredictParams, SuggestionsReply, TokenSelection,
};
pub use config::{ConfigError, LMLayerConfig};
pub use model::{DummyModel, FileModelLoader, LoadError, Model, ModelLoader, ModelRegistry};
pub use spawner::{InProcessSpawner, ProcessSpawner, SpawnError, WorkerSpawner};
pub use worker::{WorkerError, rank_suggestions, run_worker, run_worker_stdio};
