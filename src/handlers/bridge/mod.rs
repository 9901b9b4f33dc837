//! Voice bridge WebSocket handler
//!
//! Each connection gets its own session: the socket loop feeds client frames
//! into the session driver, and a sender task writes whatever the session
//! routes back to the client.

mod handler;

pub use handler::voice_bridge_handler;
