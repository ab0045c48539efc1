//! Realtime listener gateway: connections, chat history and presence.

mod gateway;
mod handler;
mod history;
mod presence;
mod protocol;
mod registry;


pub use gateway::{GatewayHandle, GatewaySettings, spawn_gateway};
pub use handler::handle_listener_ws;
