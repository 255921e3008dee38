//! HTTP and WebSocket surface of the networked core: the session
//! registry, the sync channel (server and client), the range
//! streamer, and the TUS upload endpoint.

pub mod error;
pub mod http;
pub mod hub;
pub mod registry;
pub mod state;
pub mod ws;

pub use error::{AppError, AppResult, HostError, JoinError};
pub use registry::SessionRegistry;
pub use state::AppState;
pub use ws::client::{join, JoinedSession};
