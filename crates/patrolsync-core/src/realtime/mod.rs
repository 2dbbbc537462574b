//! Real-time fan-out channel
//!
//! Maintains one logical connection per authenticated client, scoped to an
//! organization, and republishes server-confirmed field events to live
//! dashboards. Reconnects with exponential backoff and detects half-open
//! connections with a heartbeat.

mod broadcaster;
mod protocol;

pub use broadcaster::{
    channel_transport, BroadcasterConfig, ChannelConnection, ChannelTransport, ConnectionState,
    RealtimeBroadcaster, RealtimeConnection, RealtimeTransport, ServerEndpoint,
};
pub use protocol::{
    decode_server_frame, encode_client_frame, encode_message, Category, ClientFrame, ControlFrame,
    RealtimeMessage, ServerFrame,
};
