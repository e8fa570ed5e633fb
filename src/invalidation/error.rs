use thiserror::Error;

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("cannot connect to broker at {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("broker send failed: {0}")]
    Send(String),
    #[error("broker operation `{op}` exceeded {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u128 },
    #[error("malformed broker frame: {0}")]
    Protocol(String),
    #[error("broker connection closed")]
    Closed,
    #[error("broker frame {part} exceeds the limit of {limit}")]
    FrameTooLarge { part: &'static str, limit: usize },
    #[error("broker unreachable; next connect attempt in {retry_in_ms}ms")]
    Backoff { retry_in_ms: u128 },
}

impl BusError {
    pub fn connect(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn send(reason: impl ToString) -> Self {
        Self::Send(reason.to_string())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Short label used in metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BusError::Connect { .. } => "connect",
            BusError::Send(_) => "send",
            BusError::Timeout { .. } => "timeout",
            BusError::Protocol(_) => "protocol",
            BusError::Closed => "closed",
            BusError::FrameTooLarge { .. } => "frame_too_large",
            BusError::Backoff { .. } => "backoff",
        }
    }
}

/// Failures building or delivering an invalidation message.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("instance snapshot could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl PublishError {
    pub fn reason(&self) -> &'static str {
        match self {
            PublishError::Serialization(_) => "serialization",
            PublishError::Bus(err) => err.reason(),
        }
    }
}
