//! Worker side of the host-worker protocol.
//!
//! The host side (request correlation, public API) is in client.rs.
//!
//! State machine:
//! - **Uninitialized**: accepts only `initialize`; loads the model, replies `ready`
//! - **Ready**: accepts only `predict`; replies `suggestions` (or `invalid` for
//!   the null token)
//!
//! Anything else is a protocol violation and ends the worker.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::channel::{ChannelClosed, Outbox, WorkerPort};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Context, Incoming, InternalSuggestion, Message, MessageKind, Suggestion, Token, Transform,
};
use crate::model::{LoadError, Model, ModelLoader};

/// Fatal worker errors. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid message: received '{kind}' while {state}")]
    UnexpectedMessage {
        kind: MessageKind,
        state: &'static str,
    },

    #[error("failed to load model: {0}")]
    Load(#[from] LoadError),

    #[error("host channel closed")]
    ChannelClosed(#[from] ChannelClosed),

    #[error("channel error: {0}")]
    Io(#[from] io::Error),
}

enum WorkerState {
    Uninitialized,
    Ready(Arc<dyn Model>),
}

impl WorkerState {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready(_) => "ready",
        }
    }
}

/// Owns the worker state and the injected loader; replies through an [`Outbox`].
pub struct WorkerHandler {
    state: WorkerState,
    loader: Arc<dyn ModelLoader>,
    outbox: Outbox,
}

impl WorkerHandler {
    pub fn new(loader: Arc<dyn ModelLoader>, outbox: Outbox) -> Self {
        Self {
            state: WorkerState::Uninitialized,
            loader,
            outbox,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, WorkerState::Ready(_))
    }

    /// Process one message to completion.
    pub async fn handle_message(&mut self, message: Message) -> Result<(), WorkerError> {
        tracing::trace!(kind = %message.kind(), state = self.state.name(), "Worker received message");
        let model = match &self.state {
            WorkerState::Uninitialized => None,
            WorkerState::Ready(model) => Some(Arc::clone(model)),
        };
        match model {
            None => self.on_message_when_uninitialized(message).await,
            Some(model) => self.on_message_when_ready(model.as_ref(), message),
        }
    }

    async fn on_message_when_uninitialized(&mut self, message: Message) -> Result<(), WorkerError> {
        let kind = message.kind();
        let Message::Initialize {
            model,
            configuration,
        } = message
        else {
            return Err(self.unexpected(kind));
        };

        let loaded = self.loader.load(&model, &configuration).await?;
        let declared = loaded.configuration();
        self.state = WorkerState::Ready(loaded);
        tracing::info!(%model, "Model loaded, worker ready");

        self.outbox.post(Message::Ready {
            configuration: declared,
        })?;
        Ok(())
    }

    fn on_message_when_ready(&self, model: &dyn Model, message: Message) -> Result<(), WorkerError> {
        let kind = message.kind();
        let Message::Predict {
            token,
            transform,
            context,
        } = message
        else {
            return Err(self.unexpected(kind));
        };

        // Fault injection: a null token makes the host reject the call.
        let Some(token) = token else {
            tracing::debug!("Null token on predict, replying invalid");
            self.outbox.post(Message::Invalid { token: None })?;
            return Ok(());
        };

        let suggestions = predict(model, token, &context, &transform);
        self.outbox.post(Message::Suggestions { token, suggestions })?;
        Ok(())
    }

    fn unexpected(&self, kind: MessageKind) -> WorkerError {
        tracing::error!(%kind, state = self.state.name(), "Invalid message for worker state");
        WorkerError::UnexpectedMessage {
            kind,
            state: self.state.name(),
        }
    }
}

fn predict(
    model: &dyn Model,
    token: Token,
    context: &Context,
    transform: &Transform,
) -> Vec<Suggestion> {
    let raw = model.predict(context, transform);
    tracing::debug!(%token, candidates = raw.len(), "Model predicted");
    rank_suggestions(raw)
}

/// Best first: ascending weight, equal weights keep model order. NaN weights last.
pub fn rank_suggestions(mut raw: Vec<InternalSuggestion>) -> Vec<Suggestion> {
    raw.sort_by(|a, b| {
        a.weight
            .partial_cmp(&b.weight)
            .unwrap_or_else(|| a.weight.is_nan().cmp(&b.weight.is_nan()))
    });
    raw.into_iter()
        .map(InternalSuggestion::into_suggestion)
        .collect()
}

/// Run the worker against an in-process channel.
///
/// Returns `Ok` when the host hangs up, or the first fatal error.
pub async fn run_worker(loader: Arc<dyn ModelLoader>, port: WorkerPort) -> Result<(), WorkerError> {
    let WorkerPort { mut inbound, outbox } = port;
    let mut handler = WorkerHandler::new(loader, outbox);

    while let Some(message) = inbound.recv().await {
        handler.handle_message(message).await?;
    }

    tracing::info!("Host channel closed, worker exiting");
    Ok(())
}

/// Run the worker over stdin/stdout with length-prefixed JSON frames.
pub async fn run_worker_stdio(loader: Arc<dyn ModelLoader>) -> Result<(), WorkerError> {
    run_worker_framed(loader, stdin(), stdout()).await
}

/// Run the worker over any byte stream pair.
pub async fn run_worker_framed<R, W>(
    loader: Arc<dyn ModelLoader>,
    reader: R,
    writer: W,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = FramedRead::new(reader, JsonCodec::<Message>::new());
    let mut writer = FramedWrite::new(writer, JsonCodec::<Incoming>::new());

    let (outbox, mut replies) = Outbox::channel();

    // Replies are written in post order by a single forwarder.
    let forwarder = tokio::spawn(async move {
        while let Some(reply) = replies.recv().await {
            writer.send(reply).await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut handler = WorkerHandler::new(loader, outbox);
    let result = loop {
        match reader.next().await {
            Some(Ok(message)) => {
                if let Err(e) = handler.handle_message(message).await {
                    break Err(e);
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to decode host message");
                break Err(WorkerError::Io(e));
            }
            None => {
                tracing::info!("Host closed the stream, worker exiting");
                break Ok(());
            }
        }
    };

    // Dropping the handler drops the outbox, letting the forwarder drain and finish.
    drop(handler);
    match forwarder.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to write reply");
            if result.is_ok() {
                return Err(WorkerError::Io(e));
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Reply forwarder panicked");
        }
    }
    result
}
