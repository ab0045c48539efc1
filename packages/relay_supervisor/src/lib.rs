//! Relay Supervisor - lifecycle management for the relay encoder
//!
//! This crate keeps one long-running encoder process (ffmpeg by default)
//! alive: it checks that the upstream relay is reachable before spawning,
//! infers stream health from the encoder's diagnostic output, retries failed
//! runs a bounded number of times and persists a status record after every
//! transition. It has no HTTP dependencies.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_supervisor::{
//!     AlwaysReady, FileStatusSink, RelayConfig, SupervisorParts, SupervisorSettings,
//!     TokioLauncher, spawn_supervisor,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let parts = SupervisorParts::new(
//!         Arc::new(TokioLauncher),
//!         Arc::new(AlwaysReady),
//!         Arc::new(FileStatusSink::new("/tmp/encoder-status.json")),
//!     );
//!     let supervisor =
//!         spawn_supervisor(RelayConfig::default(), SupervisorSettings::default(), parts);
//!
//!     supervisor.start().await.unwrap();
//!
//!     let status = supervisor.get_status().await.unwrap();
//!     println!("encoder is {} ({:?})", status.state, status.encoder_pid);
//!
//!     supervisor.shutdown().await;
//! }
//! ```

pub mod config;
mod error;
pub mod gate;
pub mod process;
pub mod progress;
pub mod status;
mod supervisor;

pub use config::{RelayConfig, RelayConfigPatch};
pub use error::{ConfigError, ControlError, ProcessError, StatusError};
pub use gate::{AlwaysReady, ContainerGate, DependencyGate};
pub use process::{
    EncoderCommand, LaunchedProcess, ProcessControl, ProcessExit, ProcessLauncher, TokioLauncher,
};
pub use progress::{FfmpegProgressParser, HealthUpdate, LineSplitter, ProgressParser, StreamHealth};
pub use status::{FileStatusSink, StatusRecord, StatusSink, SupervisorState, read_status_file};
pub use supervisor::{
    SupervisorHandle, SupervisorParts, SupervisorSettings, WAITING_FOR_UPSTREAM, spawn_supervisor,
};
