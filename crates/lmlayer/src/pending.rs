//! Pending-request table: correlates tokens with their callers.
//!
//! Each tracked token is settled exactly once, by [`PendingRequests::keep`] or
//! [`PendingRequests::fail`]. The entry leaves the table before its caller is
//! woken, so nothing can observe a settled entry still in place.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::bridge::protocol::{Token, TokenLabel};

/// Continuation for one in-flight call.
pub type Settle<T, E> = oneshot::Sender<Result<T, E>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PendingError {
    #[error("existing request with token {}", TokenLabel::from(.0))]
    Collision(Option<Token>),

    #[error("no request associated with token {}", TokenLabel::from(.0))]
    NotFound(Option<Token>),
}

struct PendingRequest<T, E> {
    settle: Settle<T, E>,
}

/// Table keyed by wire token; `None` is the null fault-injection token.
pub struct PendingRequests<T, E> {
    entries: HashMap<Option<Token>, PendingRequest<T, E>>,
}

impl<T, E> Default for PendingRequests<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> PendingRequests<T, E> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, token: Option<Token>) -> bool {
        self.entries.contains_key(&token)
    }

    /// Look up a token's entry. The returned [`Keep`] removes it when accepted.
    pub fn keep(&mut self, token: Option<Token>) -> Result<Keep<'_, T, E>, PendingError> {
        if !self.entries.contains_key(&token) {
            return Err(PendingError::NotFound(token));
        }
        Ok(Keep { table: self, token })
    }

    /// Remove a token's entry and reject its caller with `error`.
    pub fn fail(&mut self, token: Option<Token>, error: E) -> Result<(), PendingError> {
        let entry = self
            .entries
            .remove(&token)
            .ok_or(PendingError::NotFound(token))?;
        if entry.settle.send(Err(error)).is_err() {
            tracing::debug!(token = %TokenLabel(token), "Caller dropped before rejection");
        }
        Ok(())
    }

    /// Reject every outstanding caller. Only used when the owner shuts down.
    pub fn fail_all(&mut self, mut error: impl FnMut() -> E) -> usize {
        let count = self.entries.len();
        for (token, entry) in self.entries.drain() {
            tracing::debug!(token = %TokenLabel(token), "Failing pending request on shutdown");
            let _ = entry.settle.send(Err(error()));
        }
        count
    }
}

impl<T, E: From<PendingError>> PendingRequests<T, E> {
    /// Register `settle` under `token`.
    ///
    /// On collision the existing entry is left alone and the *new* caller is
    /// rejected through `settle`.
    pub fn track(&mut self, token: Option<Token>, settle: Settle<T, E>) -> Result<(), PendingError> {
        if self.entries.contains_key(&token) {
            let error = PendingError::Collision(token);
            tracing::error!(token = %TokenLabel(token), "Token collision");
            let _ = settle.send(Err(error.into()));
            return Err(error);
        }
        self.entries.insert(token, PendingRequest { settle });
        Ok(())
    }
}

/// One-shot resolver returned by [`PendingRequests::keep`].
pub struct Keep<'a, T, E> {
    table: &'a mut PendingRequests<T, E>,
    token: Option<Token>,
}

impl<T, E> Keep<'_, T, E> {
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// Remove the entry, then resolve its caller with `value`.
    ///
    /// Returns false when the caller had already stopped waiting.
    pub fn accept(self, value: T) -> bool {
        let Some(entry) = self.table.entries.remove(&self.token) else {
            return false;
        };
        let delivered = entry.settle.send(Ok(value)).is_ok();
        if !delivered {
            tracing::debug!(token = %TokenLabel(self.token), "Caller dropped before resolution");
        }
        delivered
    }
}
