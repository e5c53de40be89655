//! Wire protocol types for host-worker communication.
//!
//! Every message is a JSON object tagged by its `message` field:
//! - **Host to worker**: `initialize`, `predict`
//! - **Worker to host**: `ready`, `suggestions`, `invalid`
//!
//! No state crosses the channel except these messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Smallest integer a token may take (`-(2^53 - 1)`).
pub const MIN_SAFE_INTEGER: i64 = -((1 << 53) - 1);

/// Largest integer a token may take (`2^53 - 1`).
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Correlates one `predict` request with its eventual reply.
///
/// Restricted to the safe-integer range so every peer can represent it exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(i64);

impl Token {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_safe(self) -> bool {
        self.0 >= MIN_SAFE_INTEGER && self.0 <= MAX_SAFE_INTEGER
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Display adapter for a nullable wire token (`null` is the fault-injection sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLabel(pub Option<Token>);

impl From<&Option<Token>> for TokenLabel {
    fn from(token: &Option<Token>) -> Self {
        Self(*token)
    }
}

impl fmt::Display for TokenLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(token) => write!(f, "{token}"),
            None => f.write_str("null"),
        }
    }
}

/// Candidate edit. Passed through untouched except for `insert`, which is the
/// fallback display text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    pub insert: String,
    #[serde(default)]
    pub delete_left: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_right: Option<u32>,
}

impl Transform {
    /// Pure insertion with nothing deleted.
    pub fn insert(text: impl Into<String>) -> Self {
        Self {
            insert: text.into(),
            ..Self::default()
        }
    }

    pub fn with_delete_left(mut self, n: u32) -> Self {
        self.delete_left = n;
        self
    }
}

/// Text surrounding the caret at prediction time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default)]
    pub left: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    #[serde(default)]
    pub start_of_buffer: bool,
    #[serde(default)]
    pub end_of_buffer: bool,
}

impl Context {
    pub fn left(text: impl Into<String>) -> Self {
        Self {
            left: text.into(),
            ..Self::default()
        }
    }
}

/// Negotiated options. Opaque to the protocol layer; a handful of well-known
/// keys get typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(Map<String, Value>);

impl Configuration {
    pub const MAX_LEFT_CONTEXT_CODE_UNITS: &'static str = "maxLeftContextCodeUnits";
    pub const LEFT_CONTEXT_CODE_UNITS: &'static str = "leftContextCodeUnits";
    pub const SUPPORTS_RIGHT_CONTEXTS: &'static str = "supportsRightContexts";

    pub fn new() -> Self {
        Self::default()
    }

    /// What the host asks for when the caller supplies nothing.
    pub fn requested_defaults() -> Self {
        Self::new()
            .with(Self::MAX_LEFT_CONTEXT_CODE_UNITS, 32)
            .with(Self::SUPPORTS_RIGHT_CONTEXTS, false)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Overrides win field-by-field; untouched fields keep their current value.
    pub fn merge(mut self, overrides: &Configuration) -> Self {
        for (key, value) in &overrides.0 {
            self.0.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn max_left_context_code_units(&self) -> Option<u64> {
        self.get(Self::MAX_LEFT_CONTEXT_CODE_UNITS)
            .and_then(Value::as_u64)
    }

    pub fn left_context_code_units(&self) -> Option<u64> {
        self.get(Self::LEFT_CONTEXT_CODE_UNITS).and_then(Value::as_u64)
    }

    pub fn supports_right_contexts(&self) -> bool {
        self.get(Self::SUPPORTS_RIGHT_CONTEXTS)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Configuration {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Candidate as produced by a model. Lower weight ranks first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalSuggestion {
    pub transform: Transform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_as: Option<String>,
    pub weight: f64,
}

impl InternalSuggestion {
    pub fn new(transform: Transform, weight: f64) -> Self {
        Self {
            transform,
            display_as: None,
            weight,
        }
    }

    pub fn with_display_as(mut self, display_as: impl Into<String>) -> Self {
        self.display_as = Some(display_as.into());
        self
    }

    /// Falls back to the insertion text when the model gave no display string.
    pub fn into_suggestion(self) -> Suggestion {
        let display_as = match self.display_as {
            Some(display_as) => display_as,
            None => self.transform.insert.clone(),
        };
        Suggestion {
            transform: self.transform,
            display_as,
        }
    }
}

/// Candidate as shown to the keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub transform: Transform,
    pub display_as: String,
}

/// Every message that crosses the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum Message {
    /// Handshake request. Must be the first message the worker sees.
    Initialize {
        model: String,
        #[serde(default, deserialize_with = "null_as_default")]
        configuration: Configuration,
    },

    /// Handshake reply carrying the model's declared configuration.
    Ready {
        #[serde(default, deserialize_with = "null_as_default")]
        configuration: Configuration,
    },

    /// `token: null` asks the worker to answer `invalid` (fault injection).
    /// The key itself is required; a missing token is not the null token.
    Predict {
        #[serde(deserialize_with = "required_nullable")]
        token: Option<Token>,
        transform: Transform,
        context: Context,
    },

    Suggestions {
        token: Token,
        suggestions: Vec<Suggestion>,
    },

    Invalid {
        #[serde(deserialize_with = "required_nullable")]
        token: Option<Token>,
    },
}

/// Nullable but not optional: serde would otherwise read a missing key as `None`.
fn required_nullable<'de, D>(deserializer: D) -> Result<Option<Token>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::deserialize(deserializer)
}

/// `configuration: null` is read as an empty configuration.
fn null_as_default<'de, D>(deserializer: D) -> Result<Configuration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Configuration>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Initialize { .. } => MessageKind::Initialize,
            Self::Ready { .. } => MessageKind::Ready,
            Self::Predict { .. } => MessageKind::Predict,
            Self::Suggestions { .. } => MessageKind::Suggestions,
            Self::Invalid { .. } => MessageKind::Invalid,
        }
    }

    /// Token carried by request-scoped kinds; `None` for handshake kinds and
    /// for the null sentinel.
    pub fn token(&self) -> Option<Token> {
        match self {
            Self::Predict { token, .. } | Self::Invalid { token } => *token,
            Self::Suggestions { token, .. } => Some(*token),
            Self::Initialize { .. } | Self::Ready { .. } => None,
        }
    }
}

/// Discriminant of [`Message`], used for logging and dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Initialize,
    Ready,
    Predict,
    Suggestions,
    Invalid,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Ready => "ready",
            Self::Predict => "predict",
            Self::Suggestions => "suggestions",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialize" => Ok(Self::Initialize),
            "ready" => Ok(Self::Ready),
            "predict" => Ok(Self::Predict),
            "suggestions" => Ok(Self::Suggestions),
            "invalid" => Ok(Self::Invalid),
            other => Err(other.to_string()),
        }
    }
}

/// A message the host received, decoded leniently.
///
/// Objects with an unknown `message` kind still decode so the host can reject
/// the pending call they name. Objects without `message` fail to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Known(Message),
    Unrecognized(UnrecognizedMessage),
}

impl From<Message> for Incoming {
    fn from(message: Message) -> Self {
        Self::Known(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnrecognizedMessage {
    pub message: String,
    #[serde(deserialize_with = "required_nullable")]
    pub token: Option<Token>,
}

impl UnrecognizedMessage {
    /// True when the kind is one we know, meaning the fields were wrong.
    pub fn is_malformed_known_kind(&self) -> bool {
        self.message.parse::<MessageKind>().is_ok()
    }
}
