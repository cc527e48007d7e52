//! Contract for the two-way streaming channel to the voice model.
//!
//! The engine never speaks a wire protocol itself. A [`Connector`] opens a
//! [`Connection`]: an outbound [`Transport`] handle plus an inbound stream of
//! [`TransportEvent`]s. Provider adapters implement these traits.

use crate::codec::WireAudio;
use crate::error::TransportError;
use crate::tools::{ToolCall, ToolDeclaration, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Which side of the failover pair an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Backup,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Primary => write!(f, "primary"),
            EndpointRole::Backup => write!(f, "backup"),
        }
    }
}

/// A model endpoint the connector can open.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            model: None,
            api_key: None,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything negotiated when a connection opens. Identical for primary and backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSetup {
    /// Rate of the PCM the engine sends
    pub input_sample_rate: u32,
    /// Rate of the PCM the model is asked to stream back
    pub output_sample_rate: u32,
    pub tool_declarations: Vec<ToolDeclaration>,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Inbound model messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Partial transcript of the user's speech.
    InputTranscript(String),
    /// Partial transcript of the model's speech.
    OutputTranscript(String),
    /// A chunk of synthesized speech as 16-bit LE PCM.
    Audio {
        data: Vec<u8>,
        sample_rate: u32,
        channels: u16,
    },
    ToolCall(ToolCall),
    TurnComplete,
    /// The model detected the user talking over it.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The channel failed; the session ends.
    Error(String),
    /// The remote side closed the channel.
    Closed { reason: Option<String> },
}

/// Outbound half of an open connection.
#[async_trait]
pub trait Transport: Send {
    async fn send_audio(&mut self, audio: WireAudio) -> Result<(), TransportError>;

    async fn send_tool_result(&mut self, result: ToolResult) -> Result<(), TransportError>;

    /// Close the channel. Safe to call more than once.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An open channel.
pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the channel is open and ready for audio.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        setup: &SessionSetup,
    ) -> Result<Connection, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_debug_hides_api_key() {
        let mut endpoint = Endpoint::new("live", "wss://example.test/live");
        endpoint.api_key = Some("sk-secret".to_string());
        let rendered = format!("{:?}", endpoint);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn endpoint_api_key_is_never_serialized() {
        let mut endpoint = Endpoint::new("live", "wss://example.test/live");
        endpoint.api_key = Some("sk-secret".to_string());
        let json = serde_json::to_string(&endpoint).unwrap();
        assert!(!json.contains("sk-secret"));
    }

    #[test]
    fn role_display() {
        assert_eq!(EndpointRole::Primary.to_string(), "primary");
        assert_eq!(EndpointRole::Backup.to_string(), "backup");
    }
}
