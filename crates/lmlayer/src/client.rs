//! Host-side proxy for a model worker.
//!
//! Flow:
//! 1. `initialize` sends the handshake once; every caller waits for `ready`
//! 2. `predict` allocates a token, tracks the caller, sends `predict`
//! 3. The event loop matches each reply to its caller by token, never by order
//!
//! All state lives in a single event-loop task. API calls reach it as commands
//! with oneshot reply channels, worker messages reach it from the channel, and
//! each is handled to completion before the next.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::channel::HostPort;
use crate::bridge::protocol::{
    Configuration, Context, Incoming, Message, Suggestion, Token, TokenLabel, Transform,
    UnrecognizedMessage,
};
use crate::pending::{PendingError, PendingRequests, Settle};
use crate::spawner::{SpawnError, WorkerSpawner};
use crate::token::{TokenAllocator, TokenError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// `predict` before the worker reported `ready`.
    #[error("model is not initialized")]
    Uninitialized,

    #[error("existing request with token {0}")]
    TokenCollision(TokenLabel),

    /// Auto-allocation ran past the safe range; build a new proxy.
    #[error("ran out of usable tokens")]
    TokenExhausted,

    /// The worker answered this request with something other than `suggestions`.
    #[error("unknown message: {kind}")]
    UnknownMessage { kind: String },

    /// A reply named a token nobody is waiting on.
    #[error("no request associated with token {0}")]
    UnknownToken(TokenLabel),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("worker channel closed")]
    Disconnected,

    /// The event loop is gone; this proxy can no longer be used.
    #[error("LMLayer is closed")]
    Closed,
}

impl From<PendingError> for ClientError {
    fn from(e: PendingError) -> Self {
        match e {
            PendingError::Collision(token) => Self::TokenCollision(TokenLabel(token)),
            PendingError::NotFound(token) => Self::UnknownToken(TokenLabel(token)),
        }
    }
}

impl From<TokenError> for ClientError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Exhausted => Self::TokenExhausted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitializeParams {
    pub model: String,
    /// Field-by-field overrides of [`Configuration::requested_defaults`].
    pub configuration: Option<Configuration>,
}

impl InitializeParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            configuration: None,
        }
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// What actually goes out in the `initialize` message.
    pub fn requested_configuration(&self) -> Configuration {
        let defaults = Configuration::requested_defaults();
        match &self.configuration {
            Some(overrides) => defaults.merge(overrides),
            None => defaults,
        }
    }
}

/// How a `predict` call picks its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenSelection {
    #[default]
    Auto,
    Custom(Token),
    /// Sends `token: null`, which the worker answers with `invalid`.
    /// Only for exercising the error path.
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictParams {
    pub transform: Transform,
    pub context: Context,
    pub token: TokenSelection,
}

impl PredictParams {
    pub fn new(transform: Transform, context: Context) -> Self {
        Self {
            transform,
            context,
            token: TokenSelection::Auto,
        }
    }

    pub fn with_custom_token(mut self, token: Token) -> Self {
        self.token = TokenSelection::Custom(token);
        self
    }

    pub fn with_null_token(mut self) -> Self {
        self.token = TokenSelection::Null;
        self
    }
}

/// Payload of the `suggestions` reply a `predict` call resolves with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestionsReply {
    pub token: Token,
    pub suggestions: Vec<Suggestion>,
}

type InitializeReply = oneshot::Sender<Result<Configuration, ClientError>>;

enum Command {
    Initialize {
        params: InitializeParams,
        reply: InitializeReply,
    },
    Predict {
        params: PredictParams,
        reply: Settle<SuggestionsReply, ClientError>,
    },
}

enum ClientState {
    Uninitialized {
        handshake_sent: bool,
        waiters: Vec<InitializeReply>,
    },
    Initialized(Configuration),
}

/// Async proxy for one worker.
pub struct LMLayer {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<Result<(), ClientError>>,
}

impl LMLayer {
    /// Start the event loop on the current tokio runtime.
    pub fn new(port: HostPort) -> Self {
        Self::with_tokens(port, TokenAllocator::new())
    }

    /// Start a worker with `spawner` and attach a proxy to it.
    pub fn spawn(spawner: &dyn WorkerSpawner) -> Result<Self, SpawnError> {
        Ok(Self::new(spawner.spawn()?))
    }

    pub(crate) fn with_tokens(port: HostPort, tokens: TokenAllocator) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            state: ClientState::Uninitialized {
                handshake_sent: false,
                waiters: Vec::new(),
            },
            pending: PendingRequests::new(),
            tokens,
            outbound: port.outbound,
        };
        let task = tokio::spawn(event_loop.run(command_rx, port.inbound));
        Self { commands, task }
    }

    /// Wait for the worker's `ready` and return its configuration.
    ///
    /// The first call sends the handshake; concurrent and later calls share it.
    pub async fn initialize(&self, params: InitializeParams) -> Result<Configuration, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Initialize { params, reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Ask the worker for suggestions. Resolves when the matching reply arrives.
    pub async fn predict(&self, params: PredictParams) -> Result<SuggestionsReply, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Predict { params, reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the event loop to end and return why it ended.
    pub async fn join(self) -> Result<(), ClientError> {
        let Self { commands, task } = self;
        let result = task.await;
        drop(commands);
        result.map_err(|e| ClientError::Protocol(format!("event loop panicked: {e}")))?
    }

    /// Stop accepting calls and wait for the event loop to finish.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        let Self { commands, task } = self;
        drop(commands);
        task.await
            .map_err(|e| ClientError::Protocol(format!("event loop panicked: {e}")))?
    }
}

struct EventLoop {
    state: ClientState,
    pending: PendingRequests<SuggestionsReply, ClientError>,
    tokens: TokenAllocator,
    outbound: mpsc::UnboundedSender<Message>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Incoming>,
    ) -> Result<(), ClientError> {
        let result = loop {
            tokio::select! {
                biased;

                incoming = inbound.recv() => {
                    match incoming {
                        Some(incoming) => {
                            if let Err(e) = self.dispatch(incoming) {
                                tracing::error!(error = %e, "Fatal error handling worker message");
                                break Err(e);
                            }
                        }
                        None => {
                            tracing::warn!("Worker channel closed");
                            break Err(ClientError::Disconnected);
                        }
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            tracing::debug!("All handles dropped, event loop exiting");
                            break Ok(());
                        }
                    }
                }
            }
        };

        let reason = result.clone().err().unwrap_or(ClientError::Closed);
        let failed = self.pending.fail_all(|| reason.clone());
        if failed > 0 {
            tracing::warn!(failed, "Failed outstanding predictions on exit");
        }
        if let ClientState::Uninitialized { waiters, .. } = &mut self.state {
            for waiter in waiters.drain(..) {
                let _ = waiter.send(Err(reason.clone()));
            }
        }
        tracing::info!("Event loop exiting");
        result
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { params, reply } => self.initialize(params, reply),
            Command::Predict { params, reply } => self.predict(params, reply),
        }
    }

    fn initialize(&mut self, params: InitializeParams, reply: InitializeReply) {
        match &mut self.state {
            ClientState::Initialized(configuration) => {
                let _ = reply.send(Ok(configuration.clone()));
            }
            ClientState::Uninitialized {
                handshake_sent,
                waiters,
            } => {
                waiters.push(reply);
                if *handshake_sent {
                    tracing::debug!(waiters = waiters.len(), "Joining pending handshake");
                    return;
                }
                *handshake_sent = true;

                let configuration = params.requested_configuration();
                tracing::info!(model = %params.model, "Sending initialize");
                if self
                    .outbound
                    .send(Message::Initialize {
                        model: params.model,
                        configuration,
                    })
                    .is_err()
                {
                    tracing::warn!("Worker channel closed before handshake");
                }
            }
        }
    }

    fn predict(&mut self, params: PredictParams, reply: Settle<SuggestionsReply, ClientError>) {
        if matches!(self.state, ClientState::Uninitialized { .. }) {
            let _ = reply.send(Err(ClientError::Uninitialized));
            return;
        }

        let token = match params.token {
            TokenSelection::Auto => match self.tokens.next_token() {
                Ok(token) => Some(token),
                Err(e) => {
                    tracing::error!(error = %e, "Token allocation failed");
                    let _ = reply.send(Err(e.into()));
                    return;
                }
            },
            TokenSelection::Custom(token) => Some(token),
            TokenSelection::Null => None,
        };

        // On collision the caller has already been rejected.
        if self.pending.track(token, reply).is_err() {
            return;
        }

        tracing::trace!(token = %TokenLabel(token), "Sending predict");
        if self
            .outbound
            .send(Message::Predict {
                token,
                transform: params.transform,
                context: params.context,
            })
            .is_err()
        {
            tracing::warn!(token = %TokenLabel(token), "Worker channel closed, predict not sent");
        }
    }

    /// Route one worker message. `Err` is fatal to the proxy.
    fn dispatch(&mut self, incoming: Incoming) -> Result<(), ClientError> {
        match incoming {
            Incoming::Known(Message::Ready { configuration }) => self.on_ready(configuration),
            Incoming::Known(Message::Suggestions { token, suggestions }) => {
                tracing::trace!(%token, count = suggestions.len(), "Suggestions received");
                let keep = self.pending.keep(Some(token))?;
                keep.accept(SuggestionsReply { token, suggestions });
                Ok(())
            }
            Incoming::Known(other) => {
                let kind = other.kind().to_string();
                self.reject(other.token(), kind)
            }
            Incoming::Unrecognized(unrecognized) => self.on_unrecognized(unrecognized),
        }
    }

    fn on_ready(&mut self, configuration: Configuration) -> Result<(), ClientError> {
        let ClientState::Uninitialized { waiters, .. } = &mut self.state else {
            return Err(ClientError::Protocol(
                "received ready after initialization".to_string(),
            ));
        };
        let waiters = std::mem::take(waiters);
        tracing::info!(waiters = waiters.len(), "Worker ready");

        self.state = ClientState::Initialized(configuration.clone());
        for waiter in waiters {
            let _ = waiter.send(Ok(configuration.clone()));
        }
        Ok(())
    }

    fn on_unrecognized(&mut self, message: UnrecognizedMessage) -> Result<(), ClientError> {
        if message.is_malformed_known_kind() {
            return Err(ClientError::Protocol(format!(
                "malformed '{}' message",
                message.message
            )));
        }
        self.reject(message.token, message.message)
    }

    fn reject(&mut self, token: Option<Token>, kind: String) -> Result<(), ClientError> {
        tracing::debug!(token = %TokenLabel(token), %kind, "Rejecting request");
        self.pending.fail(token, ClientError::UnknownMessage { kind })?;
        Ok(())
    }
}
