// Stream module entrypoint
pub mod client;       // watch API + per-endpoint dispatcher
pub mod connection;   // websocket task, reconnects, heartbeat
pub mod hash;         // message hash (routing key)
pub mod registry;     // pending watchers by hash
pub mod state;        // caches and books behind the dispatcher
pub mod subscription; // wire subscription dedupe + replay

pub use client::{ClientOptions, StreamClient};
pub use connection::{ConnectionSettings, ConnectionState, HeartbeatPolicy, ReconnectPolicy};
pub use hash::MessageHash;
pub use state::StreamValue;
