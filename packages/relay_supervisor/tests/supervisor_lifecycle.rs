//! Lifecycle scenarios for the encoder supervisor, driven by a scripted
//! launcher and gate. Timer-heavy tests run with tokio's clock paused.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use relay_supervisor::{
    ControlError, DependencyGate, EncoderCommand, FileStatusSink, LaunchedProcess, ProcessControl,
    ProcessError, ProcessExit, ProcessLauncher, RelayConfig, RelayConfigPatch, StatusError,
    StatusRecord, StatusSink, SupervisorHandle, SupervisorParts, SupervisorSettings,
    SupervisorState, WAITING_FOR_UPSTREAM, read_status_file, spawn_supervisor,
};

// =============================================================================
// Scripted collaborators
// =============================================================================

#[derive(Clone, Copy, Debug)]
enum Behavior {
    /// Starts and stays up until signalled
    Run,
    /// Starts, then exits at once with this code
    Exit(i32),
    /// Starts but ignores SIGTERM
    IgnoreTerm,
    /// Launch fails outright
    FailSpawn,
    /// Launch never confirms
    Hang,
    /// Launch confirms after a delay
    Delay(Duration),
}

type ExitSlot = Arc<Mutex<Option<oneshot::Sender<ProcessExit>>>>;

fn send_exit(slot: &ExitSlot, exit: ProcessExit) {
    if let Some(tx) = slot.lock().unwrap().take() {
        let _ = tx.send(exit);
    }
}

#[derive(Clone)]
struct FakeProcess {
    lines: mpsc::Sender<String>,
    exit: ExitSlot,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl FakeProcess {
    async fn emit(&self, line: &str) {
        self.lines.send(line.to_string()).await.unwrap();
    }

    fn exit_with(&self, code: i32) {
        send_exit(&self.exit, ProcessExit::code(code));
    }

    fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeControl {
    exit: ExitSlot,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    honour_term: bool,
}

impl ProcessControl for FakeControl {
    fn terminate(&self) -> Result<(), ProcessError> {
        self.terminated.store(true, Ordering::SeqCst);
        if self.honour_term {
            send_exit(
                &self.exit,
                ProcessExit {
                    code: None,
                    signal: Some(15),
                },
            );
        }
        Ok(())
    }

    fn kill(&self) -> Result<(), ProcessError> {
        self.killed.store(true, Ordering::SeqCst);
        send_exit(
            &self.exit,
            ProcessExit {
                code: None,
                signal: Some(9),
            },
        );
        Ok(())
    }
}

struct FakeLauncher {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    launches: AtomicUsize,
    processes: Mutex<Vec<FakeProcess>>,
    commands: Mutex<Vec<EncoderCommand>>,
}

impl FakeLauncher {
    fn new(script: Vec<Behavior>, fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            launches: AtomicUsize::new(0),
            processes: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn process(&self, index: usize) -> FakeProcess {
        self.processes.lock().unwrap()[index].clone()
    }

    fn last_command(&self) -> EncoderCommand {
        self.commands.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, command: &EncoderCommand) -> Result<LaunchedProcess, ProcessError> {
        let behavior = {
            self.commands.lock().unwrap().push(command.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(self.fallback)
        };
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;

        match behavior {
            Behavior::FailSpawn => {
                return Err(ProcessError::SpawnFailed("scripted failure".to_string()));
            }
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Delay(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let (line_tx, line_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit: ExitSlot = Arc::new(Mutex::new(Some(exit_tx)));
        let process = FakeProcess {
            lines: line_tx,
            exit: exit.clone(),
            terminated: Arc::new(AtomicBool::new(false)),
            killed: Arc::new(AtomicBool::new(false)),
        };
        let control = FakeControl {
            exit: exit.clone(),
            terminated: process.terminated.clone(),
            killed: process.killed.clone(),
            honour_term: !matches!(behavior, Behavior::IgnoreTerm),
        };
        self.processes.lock().unwrap().push(process.clone());

        if let Behavior::Exit(code) = behavior {
            process.exit_with(code);
        }

        Ok(LaunchedProcess {
            pid: Some(1000 + n as u32),
            output: line_rx,
            exit: exit_rx,
            control: Box::new(control),
        })
    }
}

struct ScriptedGate {
    ready: AtomicBool,
    checks: AtomicUsize,
}

impl ScriptedGate {
    fn new(ready: bool) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(ready),
            checks: AtomicUsize::new(0),
        })
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependencyGate for ScriptedGate {
    async fn is_upstream_ready(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<StatusRecord>>,
}

impl RecordingSink {
    fn states(&self) -> Vec<SupervisorState> {
        self.records.lock().unwrap().iter().map(|r| r.state).collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn publish(&self, record: &StatusRecord) -> Result<(), StatusError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Sink whose every write fails, like a full or read-only disk.
#[derive(Default)]
struct FailingSink {
    attempts: AtomicUsize,
}

#[async_trait]
impl StatusSink for FailingSink {
    async fn publish(&self, _record: &StatusRecord) -> Result<(), StatusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StatusError::Io(std::io::Error::other("disk full")))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn scenario_config() -> RelayConfig {
    RelayConfig {
        input_url: "rtmp://local/live/test".to_string(),
        relay_url: "rtmps://relay/s/".to_string(),
        credential: "KEY".to_string(),
        audio_bitrate: "128k".to_string(),
        ..Default::default()
    }
}

struct Harness {
    supervisor: SupervisorHandle,
    launcher: Arc<FakeLauncher>,
    gate: Arc<ScriptedGate>,
    sink: Arc<RecordingSink>,
}

fn harness(script: Vec<Behavior>, fallback: Behavior, gate_ready: bool) -> Harness {
    harness_with(script, fallback, gate_ready, SupervisorSettings::default())
}

fn harness_with(
    script: Vec<Behavior>,
    fallback: Behavior,
    gate_ready: bool,
    settings: SupervisorSettings,
) -> Harness {
    let launcher = FakeLauncher::new(script, fallback);
    let gate = ScriptedGate::new(gate_ready);
    let sink = Arc::new(RecordingSink::default());
    let parts = SupervisorParts::new(launcher.clone(), gate.clone(), sink.clone());
    let supervisor = spawn_supervisor(scenario_config(), settings, parts);
    Harness {
        supervisor,
        launcher,
        gate,
        sink,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn status(h: &Harness) -> StatusRecord {
    h.supervisor.get_status().await.unwrap()
}

// =============================================================================
// Start / run
// =============================================================================

#[tokio::test]
async fn test_start_reaches_running_and_writes_status_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let status_path = dir.path().join("encoder-status.json");

    let launcher = FakeLauncher::new(vec![], Behavior::Run);
    let parts = SupervisorParts::new(
        launcher.clone(),
        ScriptedGate::new(true),
        Arc::new(FileStatusSink::new(&status_path)),
    );
    let supervisor = spawn_supervisor(scenario_config(), SupervisorSettings::default(), parts);

    supervisor.start().await.unwrap();

    let mut running = false;
    for _ in 0..200 {
        if supervisor.get_status().await.unwrap().state == SupervisorState::Running {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(running, "encoder never reached running");

    let record = read_status_file(&status_path).unwrap();
    assert_eq!(record.state, SupervisorState::Running);
    assert!(record.encoder_pid.is_some());
    assert_eq!(record.pid, std::process::id());

    let command = launcher.last_command();
    assert_eq!(command.program, "ffmpeg");
    assert!(command.args.iter().any(|a| a == "rtmp://local/live/test"));
    assert_eq!(command.args.last().unwrap(), "rtmps://relay/s/KEY");

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_sequence_initializing_spawning_running() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let states = h.sink.states();
    assert_eq!(
        &states[..3],
        &[
            SupervisorState::Initializing,
            SupervisorState::Spawning,
            SupervisorState::Running
        ]
    );
    let st = status(&h).await;
    assert_eq!(st.encoder_pid, Some(1001));
    assert_eq!(st.restart_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_running_is_rejected() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    assert!(matches!(
        h.supervisor.start().await,
        Err(ControlError::AlreadyRunning)
    ));
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_progress_line_updates_health() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    h.launcher
        .process(0)
        .emit("frame=120 fps=30 q=-1.0 size=1024kB time=00:00:04.00 bitrate=128.0kbits/s speed=1x")
        .await;
    settle().await;

    let health = status(&h).await.stream_health;
    assert_eq!(health.total_frames_sent, 120);
    assert_eq!(health.current_bitrate, 128.0);
    assert!(health.is_connected);
    assert!(health.last_connection_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failure_line_counts_error_and_disconnects() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let process = h.launcher.process(0);
    process.emit("Output #0, flv, to 'rtmps://relay/s/KEY':").await;
    process
        .emit("[tcp @ 0x1] Connection to tcp://relay:443 failed: Connection refused")
        .await;
    settle().await;

    let health = status(&h).await.stream_health;
    assert!(!health.is_connected);
    assert_eq!(health.connection_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_write_failures_do_not_affect_lifecycle() {
    let launcher = FakeLauncher::new(vec![Behavior::Run, Behavior::Exit(1)], Behavior::Run);
    let sink = Arc::new(FailingSink::default());
    let parts = SupervisorParts::new(launcher.clone(), ScriptedGate::new(true), sink.clone());
    let supervisor = spawn_supervisor(scenario_config(), SupervisorSettings::default(), parts);

    supervisor.start().await.unwrap();
    settle().await;
    assert_eq!(supervisor.get_status().await.unwrap().state, SupervisorState::Running);

    supervisor.stop().await.unwrap();
    let st = supervisor.get_status().await.unwrap();
    assert_eq!(st.state, SupervisorState::Stopped);
    assert!(launcher.process(0).was_terminated());

    // Second run crashes; the retry is still scheduled and taken
    supervisor.start().await.unwrap();
    settle().await;
    let st = supervisor.get_status().await.unwrap();
    assert_eq!(st.state, SupervisorState::Error);
    assert_eq!(st.restart_attempts, 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(launcher.launches(), 3);
    assert_eq!(supervisor.get_status().await.unwrap().state, SupervisorState::Running);
    assert!(sink.attempts.load(Ordering::SeqCst) > 0);

    supervisor.shutdown().await;
}

// =============================================================================
// Failure and retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_crash_schedules_retry_after_delay() {
    let h = harness(vec![Behavior::Exit(1)], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Error);
    assert_eq!(st.restart_attempts, 1);
    assert_eq!(h.launcher.launches(), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.launcher.launches(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(h.launcher.launches(), 2);
    assert_eq!(status(&h).await.state, SupervisorState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_restart_budget_is_capped() {
    let h = harness(vec![], Behavior::Exit(1), true);
    h.supervisor.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Error);
    assert_eq!(st.restart_attempts, 5);
    assert_eq!(h.launcher.launches(), 6);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.launcher.launches(), 6);
    assert_eq!(status(&h).await.restart_attempts, 5);

    let max_seen = h
        .sink
        .records
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.restart_attempts)
        .max()
        .unwrap();
    assert_eq!(max_seen, 5);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_start_after_terminal_error_resumes() {
    let h = harness(vec![], Behavior::Exit(1), true);
    h.supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.launcher.launches(), 6);

    h.supervisor.start().await.unwrap();
    settle().await;
    assert_eq!(h.launcher.launches(), 7);
    assert_eq!(status(&h).await.restart_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_terminal_error_resumes() {
    let h = harness(vec![], Behavior::Exit(1), true);
    h.supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.launcher.launches(), 6);

    h.supervisor.restart().await.unwrap();
    settle().await;
    assert_eq!(h.launcher.launches(), 7);
    assert_eq!(status(&h).await.restart_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_clean_exit_does_not_retry() {
    let h = harness(vec![Behavior::Exit(0)], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Stopped);
    assert_eq!(st.restart_attempts, 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_is_retried() {
    let h = harness(vec![Behavior::FailSpawn], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Error);
    assert_eq!(st.restart_attempts, 1);
    assert!(st.detail.unwrap().contains("scripted failure"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(status(&h).await.state, SupervisorState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_timeout_is_a_failure() {
    let h = harness(vec![Behavior::Hang], Behavior::Run, true);
    h.supervisor.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(status(&h).await.state, SupervisorState::Spawning);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Error);
    assert_eq!(st.restart_attempts, 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(status(&h).await.state, SupervisorState::Running);
    assert_eq!(h.launcher.launches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stable_run_clears_restart_counter() {
    let h = harness(vec![Behavior::Exit(1)], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Running);
    assert_eq!(st.restart_attempts, 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(status(&h).await.restart_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_frames_reset_on_new_spawn() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let first = h.launcher.process(0);
    first.emit("frame=500 bitrate=128.0kbits/s").await;
    settle().await;
    assert_eq!(status(&h).await.stream_health.total_frames_sent, 500);

    first.exit_with(1);
    settle().await;
    assert_eq!(status(&h).await.stream_health.total_frames_sent, 500);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Running);
    assert_eq!(st.stream_health.total_frames_sent, 0);
    assert!(!st.stream_health.is_connected);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_status_refresh_while_running() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;
    let before = h.sink.records.lock().unwrap().len();

    tokio::time::sleep(Duration::from_secs(95)).await;
    let after = h.sink.records.lock().unwrap().len();
    assert!(after >= before + 3, "expected periodic refreshes, got {}", after - before);
}

// =============================================================================
// Dependency gate
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_gate_not_ready_defers_without_spawning() {
    let h = harness(vec![], Behavior::Run, false);

    assert!(matches!(
        h.supervisor.start().await,
        Err(ControlError::DependencyUnavailable)
    ));
    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Error);
    assert_eq!(st.detail.as_deref(), Some(WAITING_FOR_UPSTREAM));
    assert_eq!(st.restart_attempts, 0);

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(h.launcher.launches(), 0);
    assert!(h.gate.checks() >= 4);
    assert_eq!(status(&h).await.restart_attempts, 0);

    h.gate.set_ready(true);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(status(&h).await.state, SupervisorState::Running);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_gate_down_does_not_consume_budget() {
    let h = harness(vec![Behavior::Exit(1)], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;
    assert_eq!(status(&h).await.restart_attempts, 1);

    h.gate.set_ready(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    let st = status(&h).await;
    assert_eq!(st.restart_attempts, 1);
    assert_eq!(st.detail.as_deref(), Some(WAITING_FOR_UPSTREAM));
    assert_eq!(h.launcher.launches(), 1);

    h.gate.set_ready(true);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.launcher.launches(), 2);
    assert_eq!(status(&h).await.state, SupervisorState::Running);
}

// =============================================================================
// Stop / restart / shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_terminates_process() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    h.supervisor.stop().await.unwrap();
    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Stopped);
    assert_eq!(st.encoder_pid, None);
    assert!(h.launcher.process(0).was_terminated());
    assert!(!h.launcher.process(0).was_killed());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_force_kills_after_grace() {
    let h = harness(vec![Behavior::IgnoreTerm], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let started = tokio::time::Instant::now();
    h.supervisor.stop().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));

    let process = h.launcher.process(0);
    assert!(process.was_terminated());
    assert!(process.was_killed());
    assert_eq!(status(&h).await.state, SupervisorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_commands_during_stop_are_busy() {
    let h = harness(vec![Behavior::IgnoreTerm], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    let supervisor = h.supervisor.clone();
    let stopping = tokio::spawn(async move { supervisor.stop().await });
    settle().await;

    assert!(matches!(h.supervisor.start().await, Err(ControlError::Busy)));
    assert!(matches!(h.supervisor.stop().await, Err(ControlError::Busy)));
    assert!(matches!(h.supervisor.restart().await, Err(ControlError::Busy)));

    stopping.await.unwrap().unwrap();
    assert_eq!(status(&h).await.state, SupervisorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_process_cancels_retry() {
    let h = harness(vec![Behavior::Exit(1)], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;
    assert_eq!(status(&h).await.state, SupervisorState::Error);

    h.supervisor.stop().await.unwrap();
    assert_eq!(status(&h).await.state, SupervisorState::Stopped);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_launching_terminates_once_started() {
    let h = harness(
        vec![Behavior::Delay(Duration::from_secs(2))],
        Behavior::Run,
        true,
    );
    h.supervisor.start().await.unwrap();
    settle().await;
    assert_eq!(status(&h).await.state, SupervisorState::Spawning);

    h.supervisor.stop().await.unwrap();
    assert_eq!(status(&h).await.state, SupervisorState::Stopped);
    assert!(h.launcher.process(0).was_terminated());
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_running_process() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    h.supervisor.restart().await.unwrap();
    settle().await;

    assert!(h.launcher.process(0).was_terminated());
    assert_eq!(h.launcher.launches(), 2);
    let st = status(&h).await;
    assert_eq!(st.state, SupervisorState::Running);
    assert_eq!(st.encoder_pid, Some(1002));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_encoder_and_ends_actor() {
    let h = harness(vec![], Behavior::Run, true);
    h.supervisor.start().await.unwrap();
    settle().await;

    h.supervisor.shutdown().await;
    assert!(h.launcher.process(0).was_terminated());
    assert_eq!(
        h.sink.states().last().copied(),
        Some(SupervisorState::Stopped)
    );
    assert!(matches!(
        h.supervisor.get_status().await,
        Err(ControlError::SupervisorGone)
    ));
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_invalid_config_keeps_previous() {
    let h = harness(vec![], Behavior::Run, true);
    let before = h.supervisor.get_config().await.unwrap();

    let patch = RelayConfigPatch {
        chunk_size: Some(64),
        credential: Some("NEW".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        h.supervisor.update_config(patch).await,
        Err(ControlError::ConfigInvalid(_))
    ));
    assert_eq!(h.supervisor.get_config().await.unwrap(), before);
}

#[tokio::test]
async fn test_config_update_persists_and_does_not_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let config_path = dir.path().join("state").join("relay.toml");
    let settings = SupervisorSettings {
        config_path: Some(config_path.clone()),
        ..Default::default()
    };
    let h = harness_with(vec![], Behavior::Run, true, settings);
    h.supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let patch = RelayConfigPatch {
        audio_bitrate: Some("192k".to_string()),
        ..Default::default()
    };
    let updated = h.supervisor.update_config(patch).await.unwrap();
    assert_eq!(updated.audio_bitrate, "192k");

    let persisted = RelayConfig::load(&config_path).unwrap().unwrap();
    assert_eq!(persisted.audio_bitrate, "192k");

    assert_eq!(h.launcher.launches(), 1);
    assert!(!h.launcher.process(0).was_terminated());
    assert!(h
        .launcher
        .last_command()
        .args
        .iter()
        .any(|a| a == "128k"));

    h.supervisor.shutdown().await;
}
