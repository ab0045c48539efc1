//! `radio monitor`: read the encoder status file written by a running server.

use anyhow::Result;
use chrono::{DateTime, Utc};
use relay_supervisor::{StatusRecord, SupervisorState, read_status_file};
use std::path::Path;
use std::time::Duration;

use crate::config::RadioConfig;

/// A running encoder's record is rewritten at least this often; anything
/// older means the server is wedged or gone.
const STALE_AFTER: chrono::Duration = chrono::Duration::seconds(90);

pub async fn monitor_command(config: &RadioConfig, watch: Option<u64>, json: bool) -> Result<()> {
    let path = config.status_path();
    loop {
        println!("{}", render(&path, json, Utc::now())?);
        match watch {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs.max(1))).await,
            None => return Ok(()),
        }
    }
}

fn render(path: &Path, json: bool, now: DateTime<Utc>) -> Result<String> {
    let Some(record) = read_status_file(path) else {
        return Ok(if json {
            serde_json::json!({ "state": "unavailable" }).to_string()
        } else {
            "status unavailable".to_string()
        });
    };
    if json {
        return Ok(serde_json::to_string_pretty(&record)?);
    }
    Ok(summary(&record, now))
}

pub fn is_stale(record: &StatusRecord, now: DateTime<Utc>) -> bool {
    record.state == SupervisorState::Running && record.age(now) > STALE_AFTER
}

fn summary(record: &StatusRecord, now: DateTime<Utc>) -> String {
    let health = &record.stream_health;
    let mut lines = Vec::new();

    let stale = if is_stale(record, now) { " (stale)" } else { "" };
    lines.push(format!("encoder:   {}{}", record.state, stale));
    if let Some(detail) = &record.detail {
        lines.push(format!("detail:    {}", detail));
    }
    lines.push(format!(
        "pids:      supervisor {}, encoder {}",
        record.pid,
        record
            .encoder_pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string())
    ));
    lines.push(format!("restarts:  {}", record.restart_attempts));
    lines.push(format!(
        "stream:    {} | {} frames | {:.1} kbit/s | {} errors",
        if health.is_connected {
            "connected"
        } else {
            "disconnected"
        },
        health.total_frames_sent,
        health.current_bitrate,
        health.connection_errors
    ));
    lines.push(format!("updated:   {}s ago", record.age(now).num_seconds().max(0)));

    lines.join("\n")
}
