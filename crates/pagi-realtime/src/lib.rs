//! # PAGI Realtime - Conversational Audio Sessions
//!
//! This crate turns a live microphone stream into a two-way conversation with a
//! streaming voice model. Model speech is played back gapless, user speech can cut
//! the assistant off (barge-in), tool calls are dispatched mid-conversation, and a
//! failed primary endpoint falls over to a backup once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Voice Session                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │   Mic In     │→ │  Resampler   │→ │  PCM16 Encoder       │──┼──→ Transport
//! │  │ (cpal/fake)  │  │ (linear)     │  │  (16 kHz wire)       │   │   (failover:
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │    primary →
//! │                                                                  │    backup)
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │       │
//! │  │  Audio Out   │← │  Playback    │← │  PCM16 Decoder       │←──┼───────┤
//! │  │ (rodio/fake) │  │  Scheduler   │  └──────────────────────┘   │       │
//! │  └──────────────┘  └──────▲───────┘                             │       │
//! │                           │ cancel   ┌──────────────────────┐   │       │
//! │                           └──────────│ Turn Tracker         │←──┼───────┤
//! │                                      │ (barge-in: 2 words)  │   │       │
//! │                                      └──────────────────────┘   │       │
//! │                                      ┌──────────────────────┐   │       │
//! │                                      │ Tool Dispatcher      │←──┼───────┘
//! │                                      └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod devices;
pub mod error;
pub mod failover;
mod outbound;
pub mod playback;
pub mod resample;
pub mod session;
pub mod tools;
pub mod transport;
pub mod turn;

pub use codec::{decode_pcm16, encode_pcm16, AudioFrame, DecodedAudio, FrameEncoder, WireAudio};
pub use config::{AudioConfig, ConnectionConfig, EngineConfig};
pub use devices::{
    CaptureDevice, CaptureStream, FrameSender, PlaybackDevice, PlaybackEndedSender, PlaybackId,
    PlaybackOutput,
};
#[cfg(feature = "native-audio")]
pub use devices::native::{CpalCaptureDevice, RodioPlaybackDevice};
pub use error::{
    CodecError, ConfigError, ConnectError, DeviceError, RealtimeResult, SessionError,
    ToolError, TransportError,
};
pub use failover::{FailoverConnector, FailoverOutcome};
pub use playback::{PlaybackConfig, PlaybackItem, PlaybackScheduler};
pub use resample::{downmix_to_mono, resample};
pub use session::{ActiveEndpoint, SessionEvent, SessionSnapshot, SessionStatus, VoiceSession};
pub use tools::{
    dispatch, tool_fn, ExternalToolDefinition, ToolCall, ToolDeclaration, ToolHandler,
    ToolRegistry, ToolRequest, ToolResult, WebhookToolHandler,
};
pub use transport::{
    Connection, Connector, Endpoint, EndpointRole, ServerMessage, SessionSetup, Transport,
    TransportEvent,
};
pub use turn::{BargeInConfig, CompletedTurn, TurnTracker};
