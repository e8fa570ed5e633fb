use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

pub const HEADER_TYPE: &str = "Type";
pub const HEADER_KEY: &str = "Key";
pub const HEADER_MODEL: &str = "Model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A cache key is valid only while instances matching a predicate are unchanged.
    Test,
    /// A cache key depends on one instance.
    Pk,
    /// A cache key depends on another key or object key.
    Dep,
    /// An instance changed; evict everything depending on it.
    Del,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Test => "test",
            MessageType::Pk => "pk",
            MessageType::Dep => "dep",
            MessageType::Del => "del",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown invalidation message type `{0}`")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "test" => Ok(MessageType::Test),
            "pk" => Ok(MessageType::Pk),
            "dep" => Ok(MessageType::Dep),
            "del" => Ok(MessageType::Del),
            other => Err(UnknownMessageType(other.to_string())),
        }
    }
}

/// One invalidation notification as broadcast on the bus topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub kind: MessageType,
    pub key: Option<String>,
    pub model: Option<String>,
    pub payload: Bytes,
}

impl InvalidationMessage {
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            key: None,
            model: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Bus headers carried next to the payload.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![(HEADER_TYPE, self.kind.as_str().to_string())];
        if let Some(key) = &self.key {
            headers.push((HEADER_KEY, key.clone()));
        }
        if let Some(model) = &self.model {
            headers.push((HEADER_MODEL, model.clone()));
        }
        headers
    }

    /// Rebuild a message from received headers and body.
    pub fn from_headers<'a, I>(headers: I, payload: Bytes) -> Result<Self, UnknownMessageType>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut kind = None;
        let mut key = None;
        let mut model = None;
        for (name, value) in headers {
            // First occurrence wins for repeated headers.
            match name {
                HEADER_TYPE if kind.is_none() => kind = Some(value.parse::<MessageType>()?),
                HEADER_KEY if key.is_none() => key = Some(value.to_string()),
                HEADER_MODEL if model.is_none() => model = Some(value.to_string()),
                _ => {}
            }
        }

        let kind = kind.ok_or_else(|| UnknownMessageType(String::new()))?;
        Ok(Self {
            kind,
            key,
            model,
            payload,
        })
    }
}
