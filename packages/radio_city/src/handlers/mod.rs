pub mod encoder;
pub mod health;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use encoder::{
    encoder_status_handler, get_encoder_config_handler, patch_encoder_config_handler,
    restart_encoder_handler, start_encoder_handler, stop_encoder_handler,
};
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use websocket::{listener_websocket_handler, listeners_handler};
