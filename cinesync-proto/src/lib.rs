//! Wire protocol for the sync channel.
//!
//! All frames on the command channel are UTF-8 JSON. The master sends
//! [`CommandEnvelope`]s, clients send [`StatusReport`]s, and the join
//! handshake exchanges a [`JoinReply`] carrying a [`SessionSnapshot`].

pub mod message;

pub use message::{
    decode_frame, now_ms, CommandAction, CommandEnvelope, DeviceInfo, InboundFrame, JoinReply,
    SessionSnapshot, StatusReport, STREAM_URL_KEY,
};
