use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_supervisor::{
    AlwaysReady, ContainerGate, DependencyGate, EncoderCommand, FileStatusSink, LaunchedProcess,
    ProcessControl, ProcessError, ProcessExit, ProcessLauncher, RelayConfig, SupervisorParts,
    SupervisorSettings, spawn_supervisor,
};
use tokio::sync::{mpsc, oneshot};

use crate::AppState;
use crate::config::RadioConfig;
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::ChatRepository;
use crate::ws::{GatewaySettings, spawn_gateway};

/// Launcher whose "encoder" produces no output and runs until signalled.
pub struct IdleLauncher;

struct IdleControl {
    exit: Mutex<Option<oneshot::Sender<ProcessExit>>>,
}

impl IdleControl {
    fn finish(&self) -> Result<(), ProcessError> {
        let sender = self
            .exit
            .lock()
            .map_err(|_| ProcessError::SignalFailed("poisoned".into()))?
            .take()
            .ok_or(ProcessError::ProcessExited)?;
        let _ = sender.send(ProcessExit::code(0));
        Ok(())
    }
}

impl ProcessControl for IdleControl {
    fn terminate(&self) -> Result<(), ProcessError> {
        self.finish()
    }

    fn kill(&self) -> Result<(), ProcessError> {
        self.finish()
    }
}

#[async_trait]
impl ProcessLauncher for IdleLauncher {
    async fn launch(&self, _command: &EncoderCommand) -> Result<LaunchedProcess, ProcessError> {
        let (_output_tx, output) = mpsc::channel(1);
        let (exit_tx, exit) = oneshot::channel();
        Ok(LaunchedProcess {
            pid: Some(4242),
            output,
            exit,
            control: Box::new(IdleControl {
                exit: Mutex::new(Some(exit_tx)),
            }),
        })
    }
}

/// Build a fully-wired `AppState` backed by an in-memory SQLite database
/// and an idle encoder launcher.
///
/// Callers must hold the returned `TempDir` for the lifetime of the test;
/// the status file and persisted relay config live in it.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    build_state(|_| Arc::new(AlwaysReady)).await
}

/// Like `test_app_state`, but the upstream relay never becomes ready.
pub async fn test_app_state_with_gate_down() -> (AppState, tempfile::TempDir) {
    build_state(|config| {
        Arc::new(
            ContainerGate::new("relay")
                .with_docker_path(config.data_dir.join("no-such-docker").display().to_string()),
        )
    })
    .await
}

async fn build_state(
    gate: impl FnOnce(&RadioConfig) -> Arc<dyn DependencyGate>,
) -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = RadioConfig::new(Some(tmp.path().to_path_buf())).expect("config");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    crate::db::run_migrations(&pool).await.expect("migrations");

    let metrics = Arc::new(ServerMetrics::new());
    let gateway = spawn_gateway(
        GatewaySettings::default(),
        metrics.clone(),
        Some(ChatRepository::new(pool.clone())),
        Vec::new(),
    );

    let parts = SupervisorParts::new(
        Arc::new(IdleLauncher),
        gate(&config),
        Arc::new(FileStatusSink::new(config.status_path())),
    );
    let settings = SupervisorSettings {
        config_path: Some(config.relay_config_path()),
        ..SupervisorSettings::default()
    };
    let supervisor = spawn_supervisor(RelayConfig::default(), settings, parts);

    let state = AppState {
        metrics,
        db: Arc::new(Database { pool }),
        supervisor,
        gateway,
    };

    (state, tmp)
}
