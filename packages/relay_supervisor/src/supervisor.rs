//! The encoder supervisor actor.
//!
//! One task owns every piece of lifecycle state. Control commands arrive on
//! an mpsc channel with a oneshot reply; gate checks, launches, output lines
//! and exits arrive as [`Event`]s from helper tasks, tagged with the run
//! generation that produced them so late events from an abandoned run are
//! ignored. Timers (retry backoff, gate re-check, kill-after-grace, stability
//! window, periodic status refresh) are deadlines polled in the same
//! `select!` loop.

use chrono::Utc;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{RelayConfig, RelayConfigPatch};
use crate::error::{ControlError, ProcessError};
use crate::gate::DependencyGate;
use crate::process::{LaunchedProcess, ProcessControl, ProcessExit, ProcessLauncher};
use crate::progress::{FfmpegProgressParser, ProgressParser, StreamHealth};
use crate::status::{StatusRecord, StatusSink, SupervisorState};

pub const WAITING_FOR_UPSTREAM: &str = "waiting for upstream relay";

/// Timing and budget knobs for the supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    /// Delay before a failed run is retried
    pub restart_delay: Duration,
    /// Consecutive failures retried before giving up
    pub max_restart_attempts: u32,
    /// How long a launch may take to confirm
    pub spawn_timeout: Duration,
    /// Time between SIGTERM and a forced kill
    pub stop_grace: Duration,
    /// Gate re-check period while waiting for the upstream relay
    pub dependency_recheck: Duration,
    /// Uptime after which the restart counter is cleared (zero: at once)
    pub stable_after: Duration,
    /// Status refresh period while running
    pub health_interval: Duration,
    /// Where accepted configuration updates are written
    pub config_path: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(5),
            max_restart_attempts: 5,
            spawn_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            dependency_recheck: Duration::from_secs(10),
            stable_after: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
            config_path: None,
        }
    }
}

/// Collaborators the supervisor drives.
#[derive(Clone)]
pub struct SupervisorParts {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub gate: Arc<dyn DependencyGate>,
    pub parser: Arc<dyn ProgressParser>,
    pub sink: Arc<dyn StatusSink>,
}

impl SupervisorParts {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        gate: Arc<dyn DependencyGate>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            launcher,
            gate,
            parser: Arc::new(FfmpegProgressParser),
            sink,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ProgressParser>) -> Self {
        self.parser = parser;
        self
    }
}

type Reply = oneshot::Sender<Result<(), ControlError>>;

enum Command {
    Start {
        respond_to: Reply,
    },
    Stop {
        respond_to: Reply,
    },
    Restart {
        respond_to: Reply,
    },
    UpdateConfig {
        patch: RelayConfigPatch,
        respond_to: oneshot::Sender<Result<RelayConfig, ControlError>>,
    },
    GetConfig {
        respond_to: oneshot::Sender<RelayConfig>,
    },
    GetStatus {
        respond_to: oneshot::Sender<StatusRecord>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

enum Event {
    GateChecked {
        generation: u64,
        ready: bool,
    },
    Launched {
        generation: u64,
        result: Result<LaunchedProcess, ProcessError>,
    },
    Output {
        generation: u64,
        line: String,
    },
    Exited {
        generation: u64,
        exit: ProcessExit,
    },
}

/// What happens once a requested stop has been observed.
enum AfterStop {
    Idle,
    Restart,
    Exit(oneshot::Sender<()>),
}

enum Phase {
    /// Nothing in flight: initial, stopped, clean exit or terminal error
    Idle,
    /// Gate query in flight; `reply` belongs to an explicit start/restart
    Checking {
        generation: u64,
        reply: Option<Reply>,
    },
    Launching {
        generation: u64,
    },
    Running,
    /// Stop requested; `kill_at` is unset until a process handle exists
    Stopping {
        kill_at: Option<Instant>,
        after: AfterStop,
        reply: Option<Reply>,
    },
    /// Failed run, retry scheduled
    Backoff {
        retry_at: Instant,
    },
    /// Upstream not ready, re-check scheduled
    Waiting {
        recheck_at: Instant,
    },
}

/// Cloneable handle to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| ControlError::SupervisorGone)?;
        rx.await.map_err(|_| ControlError::SupervisorGone)
    }

    /// Start the encoder.
    ///
    /// Resolves once the dependency gate has answered. `Ok` means a spawn is
    /// under way; its outcome is visible through [`get_status`](Self::get_status).
    pub async fn start(&self) -> Result<(), ControlError> {
        self.request(|respond_to| Command::Start { respond_to })
            .await?
    }

    /// Stop the encoder. Resolves once the exit has been observed.
    pub async fn stop(&self) -> Result<(), ControlError> {
        self.request(|respond_to| Command::Stop { respond_to })
            .await?
    }

    /// Stop the running encoder (if any), then start it again.
    pub async fn restart(&self) -> Result<(), ControlError> {
        self.request(|respond_to| Command::Restart { respond_to })
            .await?
    }

    /// Validate, merge and persist a configuration change.
    ///
    /// The running process is left alone; the new values apply on the next
    /// spawn.
    pub async fn update_config(
        &self,
        patch: RelayConfigPatch,
    ) -> Result<RelayConfig, ControlError> {
        self.request(|respond_to| Command::UpdateConfig { patch, respond_to })
            .await?
    }

    pub async fn get_config(&self) -> Result<RelayConfig, ControlError> {
        self.request(|respond_to| Command::GetConfig { respond_to })
            .await
    }

    pub async fn get_status(&self) -> Result<StatusRecord, ControlError> {
        self.request(|respond_to| Command::GetStatus { respond_to })
            .await
    }

    /// Stop the encoder and end the actor.
    pub async fn shutdown(&self) {
        if let Err(e) = self
            .request(|respond_to| Command::Shutdown { respond_to })
            .await
        {
            debug!("Supervisor already gone at shutdown: {}", e);
        }
    }
}

/// Spawn the supervisor actor. The initial status (`initializing`) is
/// published before any command is processed.
pub fn spawn_supervisor(
    config: RelayConfig,
    settings: SupervisorSettings,
    parts: SupervisorParts,
) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(256);

    let actor = SupervisorActor {
        config,
        settings,
        parts,
        events: event_tx,
        state: SupervisorState::Initializing,
        detail: None,
        restart_attempts: 0,
        terminal: false,
        health: StreamHealth::new(Utc::now()),
        phase: Phase::Idle,
        generation: 0,
        control: None,
        encoder_pid: None,
        stable_at: None,
        health_at: None,
    };
    tokio::spawn(actor.run(cmd_rx, event_rx));

    SupervisorHandle { sender: cmd_tx }
}

struct SupervisorActor {
    config: RelayConfig,
    settings: SupervisorSettings,
    parts: SupervisorParts,
    events: mpsc::Sender<Event>,

    state: SupervisorState,
    detail: Option<String>,
    restart_attempts: u32,
    /// Retry budget exhausted; only an explicit start/restart spawns again
    terminal: bool,
    health: StreamHealth,

    phase: Phase,
    generation: u64,
    control: Option<Box<dyn ProcessControl>>,
    encoder_pid: Option<u32>,
    stable_at: Option<Instant>,
    health_at: Option<Instant>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn earliest(deadlines: &[Option<Instant>]) -> Option<Instant> {
    deadlines.iter().flatten().min().copied()
}

fn answer(reply: Option<Reply>, result: Result<(), ControlError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

impl SupervisorActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) {
        info!("Encoder supervisor started");
        self.publish().await;

        loop {
            let deadline = self.next_deadline();
            let flow = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All supervisor handles dropped");
                        ControlFlow::Break(())
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = wait_until(deadline) => {
                    self.handle_timers().await;
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }

        if let Some(control) = self.control.take() {
            let _ = control.kill();
        }
        info!("Encoder supervisor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let phase_deadline = match &self.phase {
            Phase::Backoff { retry_at } => Some(*retry_at),
            Phase::Waiting { recheck_at } => Some(*recheck_at),
            Phase::Stopping { kill_at, .. } => *kill_at,
            _ => None,
        };
        earliest(&[phase_deadline, self.stable_at, self.health_at])
    }

    // -- commands ---------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Start { respond_to } => self.handle_start(respond_to),
            Command::Stop { respond_to } => self.handle_stop(respond_to).await,
            Command::Restart { respond_to } => self.handle_restart(respond_to),
            Command::UpdateConfig { patch, respond_to } => {
                let _ = respond_to.send(self.handle_update_config(patch).await);
            }
            Command::GetConfig { respond_to } => {
                let _ = respond_to.send(self.config.clone());
            }
            Command::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status_record());
            }
            Command::Shutdown { respond_to } => return self.handle_shutdown(respond_to).await,
        }
        ControlFlow::Continue(())
    }

    fn handle_start(&mut self, respond_to: Reply) {
        match &self.phase {
            Phase::Launching { .. } | Phase::Running => {
                let _ = respond_to.send(Err(ControlError::AlreadyRunning));
            }
            Phase::Stopping { .. } | Phase::Checking { reply: Some(_), .. } => {
                let _ = respond_to.send(Err(ControlError::Busy));
            }
            _ => {
                info!("Start requested");
                self.terminal = false;
                self.restart_attempts = 0;
                self.begin_check(Some(respond_to));
            }
        }
    }

    async fn handle_stop(&mut self, respond_to: Reply) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Running => {
                info!(pid = ?self.encoder_pid, "Stopping encoder");
                self.request_terminate();
                self.phase = Phase::Stopping {
                    kill_at: Some(Instant::now() + self.settings.stop_grace),
                    after: AfterStop::Idle,
                    reply: Some(respond_to),
                };
            }
            Phase::Launching { .. } => {
                info!("Stop requested while encoder is launching");
                self.phase = Phase::Stopping {
                    kill_at: None,
                    after: AfterStop::Idle,
                    reply: Some(respond_to),
                };
            }
            busy @ (Phase::Stopping { .. } | Phase::Checking { reply: Some(_), .. }) => {
                self.phase = busy;
                let _ = respond_to.send(Err(ControlError::Busy));
            }
            _ => {
                // No process: drop any scheduled retry or re-check.
                self.generation += 1;
                self.terminal = false;
                self.stable_at = None;
                self.health_at = None;
                self.set_state(SupervisorState::Stopped, Some("stopped by request".to_string()));
                self.publish().await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn handle_restart(&mut self, respond_to: Reply) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Running => {
                info!(pid = ?self.encoder_pid, "Restarting encoder");
                self.request_terminate();
                self.phase = Phase::Stopping {
                    kill_at: Some(Instant::now() + self.settings.stop_grace),
                    after: AfterStop::Restart,
                    reply: Some(respond_to),
                };
            }
            Phase::Launching { .. } => {
                self.phase = Phase::Stopping {
                    kill_at: None,
                    after: AfterStop::Restart,
                    reply: Some(respond_to),
                };
            }
            busy @ (Phase::Stopping { .. } | Phase::Checking { reply: Some(_), .. }) => {
                self.phase = busy;
                let _ = respond_to.send(Err(ControlError::Busy));
            }
            _ => {
                info!("Restart requested with no running encoder");
                if self.terminal {
                    self.terminal = false;
                    self.restart_attempts = 0;
                }
                self.begin_check(Some(respond_to));
            }
        }
    }

    async fn handle_update_config(
        &mut self,
        patch: RelayConfigPatch,
    ) -> Result<RelayConfig, ControlError> {
        let next = self.config.apply(&patch).inspect_err(|e| {
            warn!("Rejected relay configuration update: {}", e);
        })?;
        if let Some(path) = &self.settings.config_path {
            next.save(path).await.inspect_err(|e| {
                error!("Failed to persist relay configuration: {}", e);
            })?;
        }
        info!("Relay configuration updated; applies on next start");
        self.config = next.clone();
        Ok(next)
    }

    async fn handle_shutdown(&mut self, done: oneshot::Sender<()>) -> ControlFlow<()> {
        info!("Supervisor shutting down");
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Running => {
                self.request_terminate();
                self.phase = Phase::Stopping {
                    kill_at: Some(Instant::now() + self.settings.stop_grace),
                    after: AfterStop::Exit(done),
                    reply: None,
                };
                ControlFlow::Continue(())
            }
            Phase::Launching { .. } => {
                self.phase = Phase::Stopping {
                    kill_at: None,
                    after: AfterStop::Exit(done),
                    reply: None,
                };
                ControlFlow::Continue(())
            }
            Phase::Stopping {
                kill_at,
                after,
                mut reply,
            } => {
                if let AfterStop::Restart = after {
                    answer(reply.take(), Err(ControlError::SupervisorGone));
                }
                self.phase = Phase::Stopping {
                    kill_at,
                    after: AfterStop::Exit(done),
                    reply,
                };
                ControlFlow::Continue(())
            }
            Phase::Checking { reply, .. } => {
                answer(reply, Err(ControlError::SupervisorGone));
                self.set_state(SupervisorState::Stopped, Some("supervisor shut down".to_string()));
                self.publish().await;
                let _ = done.send(());
                ControlFlow::Break(())
            }
            _ => {
                self.set_state(SupervisorState::Stopped, Some("supervisor shut down".to_string()));
                self.publish().await;
                let _ = done.send(());
                ControlFlow::Break(())
            }
        }
    }

    // -- events -----------------------------------------------------------

    async fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::GateChecked { generation, ready } => {
                self.on_gate_checked(generation, ready).await;
                ControlFlow::Continue(())
            }
            Event::Launched { generation, result } => self.on_launched(generation, result).await,
            Event::Output { generation, line } => {
                if generation == self.generation {
                    self.on_output(&line).await;
                }
                ControlFlow::Continue(())
            }
            Event::Exited { generation, exit } => {
                if generation != self.generation {
                    debug!(generation, "Ignoring exit of an abandoned run");
                    return ControlFlow::Continue(());
                }
                self.on_exited(exit).await
            }
        }
    }

    async fn on_gate_checked(&mut self, generation: u64, ready: bool) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Checking {
                generation: expected,
                reply,
            } if expected == generation => {
                if ready {
                    self.begin_spawn().await;
                    answer(reply, Ok(()));
                } else {
                    self.enter_waiting().await;
                    answer(reply, Err(ControlError::DependencyUnavailable));
                }
            }
            other => self.phase = other,
        }
    }

    async fn on_launched(
        &mut self,
        generation: u64,
        result: Result<LaunchedProcess, ProcessError>,
    ) -> ControlFlow<()> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Launching { generation: expected } if expected == generation => match result {
                Ok(process) => self.on_started(generation, process).await,
                Err(e) => {
                    error!("Encoder failed to start: {}", e);
                    self.on_failure(e.to_string()).await;
                }
            },
            Phase::Stopping {
                kill_at: None,
                after,
                reply,
            } if generation == self.generation && self.control.is_none() => match result {
                Ok(process) => {
                    self.attach(generation, process);
                    self.request_terminate();
                    self.phase = Phase::Stopping {
                        kill_at: Some(Instant::now() + self.settings.stop_grace),
                        after,
                        reply,
                    };
                }
                Err(e) => {
                    debug!("Launch failed while stopping: {}", e);
                    return self.finish_stop(after, reply).await;
                }
            },
            other => {
                self.phase = other;
                if let Ok(process) = result {
                    debug!(pid = ?process.pid, "Killing process from an abandoned launch");
                    let _ = process.control.kill();
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_started(&mut self, generation: u64, process: LaunchedProcess) {
        self.attach(generation, process);
        self.phase = Phase::Running;

        let now = Instant::now();
        if self.settings.stable_after.is_zero() {
            self.restart_attempts = 0;
        } else {
            self.stable_at = Some(now + self.settings.stable_after);
        }
        self.health_at = Some(now + self.settings.health_interval);

        info!(pid = ?self.encoder_pid, "Encoder running");
        self.set_state(SupervisorState::Running, None);
        self.publish().await;
    }

    async fn on_output(&mut self, line: &str) {
        let update = self.parts.parser.parse_line(line);
        if update.failure {
            warn!(line = %line, "Encoder reported a stream failure");
        } else {
            trace!(line = %line, "encoder");
        }

        let transition = self.health.apply(&update, Utc::now());
        if transition.connected {
            info!("Relay stream established");
            self.publish().await;
        } else if transition.disconnected {
            warn!("Relay stream lost");
            self.publish().await;
        }
    }

    async fn on_exited(&mut self, exit: ProcessExit) -> ControlFlow<()> {
        self.control = None;
        self.encoder_pid = None;
        self.stable_at = None;
        self.health_at = None;
        self.health.is_connected = false;

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Stopping { after, reply, .. } => {
                info!("Encoder stopped ({})", exit);
                return self.finish_stop(after, reply).await;
            }
            Phase::Running if exit.success() => {
                info!("Encoder exited cleanly");
                self.set_state(
                    SupervisorState::Stopped,
                    Some("encoder exited cleanly".to_string()),
                );
                self.publish().await;
            }
            Phase::Running => {
                warn!("Encoder {}", exit);
                self.on_failure(format!("encoder {}", exit)).await;
            }
            other => {
                debug!("Exit observed outside a run ({})", exit);
                self.phase = other;
            }
        }
        ControlFlow::Continue(())
    }

    // -- timers -----------------------------------------------------------

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        match &mut self.phase {
            Phase::Backoff { retry_at } if *retry_at <= now => {
                info!(attempt = self.restart_attempts, "Retrying encoder");
                self.begin_check(None);
            }
            Phase::Waiting { recheck_at } if *recheck_at <= now => {
                debug!("Re-checking upstream relay");
                self.begin_check(None);
            }
            Phase::Stopping { kill_at, .. } if kill_at.is_some_and(|k| k <= now) => {
                *kill_at = None;
                warn!(pid = ?self.encoder_pid, "Encoder ignored SIGTERM; killing");
                if let Some(control) = &self.control {
                    if let Err(e) = control.kill() {
                        warn!("Failed to kill encoder: {}", e);
                    }
                }
            }
            _ => {}
        }

        if self.stable_at.is_some_and(|s| s <= now) {
            self.stable_at = None;
            if matches!(self.phase, Phase::Running) && self.restart_attempts > 0 {
                info!("Encoder stable; clearing restart counter");
                self.restart_attempts = 0;
                self.publish().await;
            }
        }

        if self.health_at.is_some_and(|h| h <= now) {
            if matches!(self.phase, Phase::Running) {
                self.publish().await;
                self.health_at = Some(now + self.settings.health_interval);
            } else {
                self.health_at = None;
            }
        }
    }

    // -- transitions ------------------------------------------------------

    fn begin_check(&mut self, reply: Option<Reply>) {
        self.generation += 1;
        let generation = self.generation;
        self.phase = Phase::Checking { generation, reply };

        let gate = self.parts.gate.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let ready = gate.is_upstream_ready().await;
            let _ = events.send(Event::GateChecked { generation, ready }).await;
        });
    }

    async fn enter_waiting(&mut self) {
        info!(
            "Upstream relay not ready; re-checking in {}s",
            self.settings.dependency_recheck.as_secs()
        );
        self.phase = Phase::Waiting {
            recheck_at: Instant::now() + self.settings.dependency_recheck,
        };
        self.set_state(SupervisorState::Error, Some(WAITING_FOR_UPSTREAM.to_string()));
        self.publish().await;
    }

    async fn begin_spawn(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.health = StreamHealth::new(Utc::now());
        self.stable_at = None;
        self.phase = Phase::Launching { generation };
        self.set_state(SupervisorState::Spawning, None);
        self.publish().await;

        let command = self.config.to_command();
        info!(
            attempt = self.restart_attempts,
            command = %command.display_redacted(&self.config.credential),
            "Spawning encoder"
        );

        let launcher = self.parts.launcher.clone();
        let events = self.events.clone();
        let timeout = self.settings.spawn_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, launcher.launch(&command)).await {
                Ok(result) => result,
                Err(_) => Err(ProcessError::SpawnTimeout(timeout.as_secs())),
            };
            let _ = events.send(Event::Launched { generation, result }).await;
        });
    }

    /// Take ownership of a started process and forward its output and exit
    /// into the event channel.
    fn attach(&mut self, generation: u64, process: LaunchedProcess) {
        let LaunchedProcess {
            pid,
            mut output,
            mut exit,
            control,
        } = process;
        self.encoder_pid = pid;
        self.control = Some(control);

        let events = self.events.clone();
        tokio::spawn(async move {
            let exit = loop {
                tokio::select! {
                    biased;
                    line = output.recv() => match line {
                        Some(line) => {
                            if events.send(Event::Output { generation, line }).await.is_err() {
                                return;
                            }
                        }
                        None => break (&mut exit).await.unwrap_or_default(),
                    },
                    result = &mut exit => {
                        while let Ok(line) = output.try_recv() {
                            let _ = events.send(Event::Output { generation, line }).await;
                        }
                        break result.unwrap_or_default();
                    }
                }
            };
            let _ = events.send(Event::Exited { generation, exit }).await;
        });
    }

    fn request_terminate(&self) {
        if let Some(control) = &self.control {
            if let Err(e) = control.terminate() {
                warn!("Failed to signal encoder: {}; forcing kill", e);
                let _ = control.kill();
            }
        }
    }

    async fn on_failure(&mut self, detail: String) {
        let max = self.settings.max_restart_attempts;
        if self.restart_attempts < max {
            self.restart_attempts += 1;
            let delay = self.settings.restart_delay;
            self.phase = Phase::Backoff {
                retry_at: Instant::now() + delay,
            };
            warn!(
                attempt = self.restart_attempts,
                max, "Encoder failed; retrying in {}s", delay.as_secs()
            );
            self.set_state(
                SupervisorState::Error,
                Some(format!(
                    "{}; restart {}/{} in {}s",
                    detail,
                    self.restart_attempts,
                    max,
                    delay.as_secs()
                )),
            );
        } else {
            error!(max, "Encoder failed; restart budget exhausted");
            self.terminal = true;
            self.phase = Phase::Idle;
            self.set_state(
                SupervisorState::Error,
                Some(format!("{}; giving up after {} restart attempts", detail, max)),
            );
        }
        self.publish().await;
    }

    async fn finish_stop(&mut self, after: AfterStop, reply: Option<Reply>) -> ControlFlow<()> {
        self.phase = Phase::Idle;
        self.stable_at = None;
        self.health_at = None;
        self.set_state(SupervisorState::Stopped, Some("stopped by request".to_string()));
        self.publish().await;

        match after {
            AfterStop::Idle => {
                answer(reply, Ok(()));
                ControlFlow::Continue(())
            }
            AfterStop::Restart => {
                self.begin_check(reply);
                ControlFlow::Continue(())
            }
            AfterStop::Exit(done) => {
                answer(reply, Ok(()));
                let _ = done.send(());
                ControlFlow::Break(())
            }
        }
    }

    fn set_state(&mut self, state: SupervisorState, detail: Option<String>) {
        if state != self.state {
            debug!(from = %self.state, to = %state, "Encoder state changed");
        }
        self.state = state;
        self.detail = detail;
    }

    fn status_record(&self) -> StatusRecord {
        StatusRecord {
            state: self.state,
            detail: self.detail.clone(),
            pid: std::process::id(),
            encoder_pid: self.encoder_pid,
            restart_attempts: self.restart_attempts,
            timestamp: Utc::now(),
            stream_health: self.health.clone(),
        }
    }

    async fn publish(&self) {
        let record = self.status_record();
        if let Err(e) = self.parts.sink.publish(&record).await {
            warn!("Failed to write encoder status: {}", e);
        }
    }
}
