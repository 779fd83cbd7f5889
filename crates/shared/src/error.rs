//! Error types for the realtime client and its HTTP surfaces.

/// Failures of the realtime update client.
///
/// None of these escape to consumer code: the connection state machine and
/// the polling engine handle them where they occur.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    /// The realtime URL could not be discovered.
    #[error("realtime configuration unavailable: {0}")]
    ConfigUnavailable(String),

    /// The server refused the credential, or never acknowledged it in time.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Socket error or abnormal close.
    #[error("transport error: {0}")]
    Transport(String),

    /// The reconnect policy gave up.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// One topic's probe failed during a polling cycle.
    #[error("polling fetch failed for {topic}: {reason}")]
    PollingFetch { topic: String, reason: String },

    /// An inbound frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl RealtimeError {
    /// Whether the reconnect policy applies to this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::AuthRejected(_) | RealtimeError::Transport(_)
        )
    }
}

/// HTTP-layer error used by the API client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    /// The GraphQL response carried an `errors` array.
    #[error("GraphQL error: {0}")]
    GraphQl(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Deserialize(err.to_string())
    }
}

impl ApiError {
    pub fn into_polling_error(self, topic: &str) -> RealtimeError {
        RealtimeError::PollingFetch {
            topic: topic.to_string(),
            reason: self.to_string(),
        }
    }
}

impl From<ApiError> for RealtimeError {
    fn from(err: ApiError) -> Self {
        RealtimeError::ConfigUnavailable(err.to_string())
    }
}
