//! WebSocket signaling
//!
//! One socket per connection. Inbound messages are handled sequentially
//! in arrival order, and every request produces exactly one terminal
//! event on the socket that received it.

mod connections;
mod handler;

pub use connections::ConnectionManager;
pub use handler::ws_handler;
