//! Boots a real supervisor on a temp state directory and drives it over HTTP.

#![cfg(unix)]

use std::time::Duration;

use koi_daemon::{
    DaemonClient, DaemonContext, DaemonError, InstanceStatus, SingletonLock, run_server,
};
use koi_paths::KoiPaths;

const CONFIG: &str = r#"
stop_timeout_secs = 2
env = ["KOI_MODE=test"]

[[instance]]
name = "default"
command = "sh"
args = ["-c", "echo ready mode=$KOI_MODE; exec sleep 30"]

[[instance]]
name = "manual"
command = "sh"
args = ["-c", "echo manual; exec sleep 30"]
autostart = false
"#;

fn write_config(home: &std::path::Path) {
    let paths = KoiPaths::from_dir(home.to_path_buf());
    std::fs::create_dir_all(paths.config_dir()).unwrap();
    std::fs::write(paths.config_file(), CONFIG).unwrap();
}

async fn wait_for_client(lock: &SingletonLock) -> DaemonClient {
    for _ in 0..300 {
        if let Ok(client) = DaemonClient::from_lock(lock) {
            if client.ping().await.is_ok() {
                return client;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon never became reachable");
}

async fn wait_for_status(client: &DaemonClient, name: &str, status: InstanceStatus) {
    for _ in 0..500 {
        let instances = client.list().await.unwrap();
        if instances.iter().any(|i| i.name == name && i.status == status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{name} never reached {status}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daemon_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path());

    let ctx = DaemonContext::load(Some(dir.path().to_path_buf())).unwrap();
    let log_file = ctx.paths.instance_log_file("default");
    let lock = SingletonLock::new(ctx.paths.daemon_lock_file());
    let server = tokio::spawn(run_server(ctx));

    let client = wait_for_client(&lock).await;

    let status = client.status().await.unwrap();
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.host, "127.0.0.1");
    assert_eq!(status.instance_count, 2);

    wait_for_status(&client, "default", InstanceStatus::Running).await;
    let instances = client.list().await.unwrap();
    let manual = instances.iter().find(|i| i.name == "manual").unwrap();
    assert_eq!(manual.status, InstanceStatus::Stopped);

    let started = client.start("manual").await.unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert!(started.pid.is_some());

    let err = client.start("manual").await.unwrap_err();
    assert!(matches!(
        err,
        DaemonError::Remote { ref code, .. } if code == "instance_already_running"
    ));

    let err = client.stop("ghost").await.unwrap_err();
    assert!(matches!(
        err,
        DaemonError::Remote { ref code, .. } if code == "instance_not_found"
    ));

    client.stop("manual").await.unwrap();
    wait_for_status(&client, "manual", InstanceStatus::Stopped).await;

    let before = client
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.name == "default")
        .and_then(|i| i.pid)
        .unwrap();
    client.restart("default").await.unwrap();
    let mut restarted = None;
    for _ in 0..500 {
        let pid = client
            .list()
            .await
            .unwrap()
            .into_iter()
            .find(|i| i.name == "default" && i.status == InstanceStatus::Running)
            .and_then(|i| i.pid);
        if pid.is_some_and(|pid| pid != before) {
            restarted = pid;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(restarted.is_some(), "default was never restarted");

    client.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(15), server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert!(!lock.path().exists());
    let log = std::fs::read_to_string(log_file).unwrap();
    assert!(log.contains("ready mode=test"));
    assert!(matches!(client.ping().await, Err(DaemonError::NotRunning)));
}
