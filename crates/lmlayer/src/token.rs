//! Token allocation for outgoing requests.

use crate::bridge::protocol::{MIN_SAFE_INTEGER, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Every safe integer has been issued. The owning proxy must be replaced.
    #[error("ran out of usable tokens")]
    Exhausted,
}

/// Issues strictly increasing tokens, starting at the smallest safe integer.
///
/// Never wraps: once past the safe range every call fails.
#[derive(Debug)]
pub struct TokenAllocator {
    current: i64,
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self::starting_at(MIN_SAFE_INTEGER)
    }

    pub(crate) fn starting_at(current: i64) -> Self {
        Self { current }
    }

    pub fn next_token(&mut self) -> Result<Token, TokenError> {
        let token = Token::new(self.current);
        if !token.is_safe() {
            return Err(TokenError::Exhausted);
        }
        self.current += 1;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::MAX_SAFE_INTEGER;

    #[test]
    fn first_token_is_min_safe_integer() {
        let mut tokens = TokenAllocator::new();
        assert_eq!(tokens.next_token().unwrap(), Token::new(MIN_SAFE_INTEGER));
    }

    #[test]
    fn tokens_strictly_increase() {
        let mut tokens = TokenAllocator::new();
        let issued: Vec<Token> = (0..1000).map(|_| tokens.next_token().unwrap()).collect();

        assert!(issued.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn exhaustion_is_permanent() {
        let mut tokens = TokenAllocator::starting_at(MAX_SAFE_INTEGER);
        assert_eq!(tokens.next_token().unwrap(), Token::new(MAX_SAFE_INTEGER));
        assert_eq!(tokens.next_token(), Err(TokenError::Exhausted));
        assert_eq!(tokens.next_token(), Err(TokenError::Exhausted));
    }
}
