// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use roaster_logger::acquisition::{read_records, SampleStatus};
use roaster_logger::cli::{self, Cli};
use roaster_logger::session::{MarkerStore, SessionMarker, StopHandle};
use tempfile::tempdir;

static INIT: Once = Once::new();

// Setup logger for tests
fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

fn write_settings(dir: &Path, license: &str, device: &str) -> Result<PathBuf> {
    let path = dir.join("settings.yaml");
    let yaml = format!(
        r#"app:
  name: test-roaster
  log_dir: "{logs}"
{license}ports:
  - id: roaster_1
    device: "{device}"
    baudrate: 9600
    parity: N
    stopbits: 1
    bytesize: 8
    timeout: 1.0
    unit_id: 1
    read_count: 2
    connect_retries: 1
    connect_retry_delay: 0.0
    read_retry_delay: 0.0
"#,
        logs = dir.join("logs").display(),
    );
    fs::write(&path, yaml)?;
    Ok(path)
}

async fn run_cli(args: &[&str]) -> (Result<()>, String) {
    let cli = Cli::parse_from(std::iter::once("roaster-logger").chain(args.iter().copied()));
    let mut out = Vec::new();
    let result = cli::run(cli, StopHandle::new(), &mut out).await;
    (result, String::from_utf8_lossy(&out).into_owned())
}

fn log_files(logs: &Path) -> Vec<PathBuf> {
    fs::read_dir(logs)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn stub_cycle_logs_three_ok_records() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let settings = write_settings(dir.path(), "", "COM3")?;
    let settings = settings.to_string_lossy();

    let (result, out) = run_cli(&[
        "--settings",
        &settings,
        "start-cycle",
        "--port-id",
        "roaster_1",
        "--cycle-name",
        "test",
        "--iterations",
        "3",
        "--interval",
        "0.5",
    ])
    .await;
    result?;
    assert!(out.contains("stopped: 3 sample(s)"), "{out}");

    let logs = dir.path().join("logs");
    let files = log_files(&logs);
    assert_eq!(files.len(), 1);
    let stem = files[0]
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    assert!(stem.starts_with("test_"), "{stem}");

    let records = read_records(&logs, &stem)?;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == SampleStatus::Ok));
    assert!(records.iter().all(|r| r.registers == vec![0, 1]));
    assert!(MarkerStore::new(logs.join("sessions")).list()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn expired_license_refuses_to_start() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let license = "license:\n  enabled: true\n  expires_at: \"2000-01-01T00:00:00Z\"\n";
    let settings = write_settings(dir.path(), license, "COM3")?;
    let settings = settings.to_string_lossy();

    let (result, _) = run_cli(&[
        "--settings",
        &settings,
        "start-cycle",
        "--port-id",
        "roaster_1",
        "--cycle-name",
        "test",
    ])
    .await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("not permitted"), "{err}");
    assert_ne!(cli::exit_code(&err), 0);
    assert!(log_files(&dir.path().join("logs")).is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_endpoint_fails_without_marker() -> Result<()> {
    setup();
    let dir = tempdir()?;
    // nothing listens on port 1 of the loopback interface
    let settings = write_settings(dir.path(), "", "127.0.0.1:1")?;
    let settings = settings.to_string_lossy();

    let (result, _) = run_cli(&[
        "--settings",
        &settings,
        "start-cycle",
        "--port-id",
        "roaster_1",
        "--cycle-name",
        "test",
        "--client",
        "tcp",
        "--timeout",
        "0.5",
    ])
    .await;
    let err = result.unwrap_err();
    assert_eq!(cli::exit_code(&err), 5);
    assert!(err.to_string().contains("after 2 attempt(s)"), "{err}");

    let logs = dir.path().join("logs");
    assert!(MarkerStore::new(logs.join("sessions")).list()?.is_empty());
    assert!(log_files(&logs).is_empty());
    Ok(())
}

#[tokio::test]
async fn stop_command_ends_running_cycle() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let settings_path = write_settings(dir.path(), "", "COM3")?;
    let settings = settings_path.to_string_lossy().into_owned();
    let markers = MarkerStore::new(dir.path().join("logs").join("sessions"));

    let run_settings = settings.clone();
    let task = tokio::spawn(async move {
        run_cli(&[
            "--settings",
            &run_settings,
            "start-cycle",
            "--port-id",
            "roaster_1",
            "--cycle-name",
            "long",
            "--continuous",
            "--interval",
            "0.05",
        ])
        .await
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while markers.load("roaster_1")?.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "session never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (result, out) = run_cli(&["--settings", &settings, "stop", "--port-id", "roaster_1"]).await;
    result?;
    assert!(out.contains("Stop requested for port 'roaster_1'"), "{out}");
    assert!(markers.load("roaster_1")?.is_none());

    let (result, out) = tokio::time::timeout(Duration::from_secs(2), task).await??;
    result?;
    assert!(out.contains("stopped"), "{out}");
    assert!(out.contains("session marker removed"), "{out}");
    Ok(())
}

#[tokio::test]
async fn crashed_session_stays_active_until_stopped() -> Result<()> {
    setup();
    let dir = tempdir()?;
    let settings = write_settings(dir.path(), "", "COM3")?;
    let settings = settings.to_string_lossy();
    let markers = MarkerStore::new(dir.path().join("logs").join("sessions"));

    // left behind by a process that died without cleaning up
    markers.create(&SessionMarker {
        cycle_name: "crashed".to_string(),
        port_id: "roaster_1".to_string(),
        started_at: Utc::now(),
        pid: u32::MAX,
        host: Some("roaster-pc".to_string()),
        log_file: dir.path().join("logs").join("crashed.log"),
    })?;
    fs::write(markers.dir().join("garbage.json"), b"{")?;

    let (result, out) = run_cli(&["--settings", &settings, "status"]).await;
    result?;
    assert!(out.contains("active: port 'roaster_1' cycle 'crashed'"), "{out}");
    assert!(out.contains("stale: unreadable marker"), "{out}");

    let (result, out) = run_cli(&["--settings", &settings, "stop"]).await;
    result?;
    assert!(out.contains("Stop requested for 2 session(s)"), "{out}");

    let (result, out) = run_cli(&["--settings", &settings, "status"]).await;
    result?;
    assert!(out.contains("No active session"), "{out}");

    // stopping again still succeeds
    let (result, out) = run_cli(&["--settings", &settings, "stop", "--port-id", "roaster_1"]).await;
    result?;
    assert!(out.contains("No active session on port 'roaster_1'"), "{out}");
    Ok(())
}
