#![cfg(unix)]

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use futures::StreamExt;
use gringo_core::{BoxStream, CommandSpec, Error, ProcessManager, UnixProcessManager};

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn script(name: &str) -> CommandSpec {
    CommandSpec {
        name: name.to_owned(),
        cmd: vec!["bash".to_owned(), format!("./{name}.sh")],
        cwd: Some(fixtures()),
        env: BTreeMap::new(),
    }
}

async fn collect(mut stream: BoxStream<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = stream.next().await {
        lines.push(line);
    }
    lines
}

#[tokio::test]
async fn test_process_manager_stdout() {
    let pm = UnixProcessManager::new();

    let out = pm.spawn(script("stdout")).await.unwrap();

    assert_eq!(
        collect(out.stdout).await,
        vec!["INFO: line 1", "INFO: line 2", "INFO: stdout.sh finished"]
    );
    assert!(collect(out.stderr).await.is_empty());
    assert_eq!(pm.wait(out.id, Duration::from_secs(5)).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_process_manager_stderr() {
    let pm = UnixProcessManager::new();

    let out = pm.spawn(script("stderr")).await.unwrap();

    assert!(collect(out.stdout).await.is_empty());
    assert_eq!(
        collect(out.stderr).await,
        vec!["ERROR: line 1", "ERROR: line 2", "ERROR: stderr.sh finished"]
    );
}

#[tokio::test]
async fn test_process_manager_both() {
    let pm = UnixProcessManager::new();

    let out = pm.spawn(script("both")).await.unwrap();

    let (stdout, stderr) = tokio::join!(collect(out.stdout), collect(out.stderr));
    assert_eq!(
        stdout,
        vec![
            "STDOUT: message 2",
            "STDOUT: message 4",
            "STDOUT: message 6",
            "STDOUT: message 8",
            "both.sh done"
        ]
    );
    assert_eq!(
        stderr,
        vec![
            "STDERR: message 1",
            "STDERR: message 3",
            "STDERR: message 5",
            "STDERR: message 7"
        ]
    );
}

#[tokio::test]
async fn test_process_manager_env_and_exit_code() {
    let pm = UnixProcessManager::new();

    let out = pm
        .spawn(CommandSpec {
            name: "env".to_owned(),
            cmd: vec![
                "bash".to_owned(),
                "-c".to_owned(),
                "echo \"$GREETING\"; exit 3".to_owned(),
            ],
            cwd: None,
            env: BTreeMap::from([("GREETING".to_owned(), "hola".to_owned())]),
        })
        .await
        .unwrap();

    assert_eq!(collect(out.stdout).await, vec!["hola"]);
    assert_eq!(pm.wait(out.id, Duration::from_secs(5)).await.unwrap(), Some(3));
    // The exit code stays available until the process is released.
    assert_eq!(pm.wait(out.id, Duration::ZERO).await.unwrap(), Some(3));

    pm.release(out.id);
    assert!(matches!(
        pm.wait(out.id, Duration::ZERO).await,
        Err(Error::UnknownProcess(_))
    ));
}

#[tokio::test]
async fn test_process_manager_spawn_missing_command() {
    let pm = UnixProcessManager::new();

    let result = pm
        .spawn(CommandSpec {
            name: "missing".to_owned(),
            cmd: vec!["gringo-definitely-not-a-command".to_owned()],
            cwd: None,
            env: BTreeMap::new(),
        })
        .await;

    assert!(matches!(result, Err(Error::ProcessSpawn { .. })));
}

#[tokio::test]
async fn test_process_manager_sigterm() {
    let pm = UnixProcessManager::new();

    let out = pm.spawn(script("sigterm_exits")).await.unwrap();
    assert_eq!(pm.wait(out.id, Duration::from_millis(100)).await.unwrap(), None);

    pm.shutdown(out.id).await.unwrap();
    let result = pm.wait(out.id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(result, Some(0));
}

#[tokio::test]
async fn test_process_manager_sigkill() {
    let pm = UnixProcessManager::new();

    let out = pm.spawn(script("ignore_sigterm")).await.unwrap();

    pm.shutdown(out.id).await.unwrap();
    let result = pm.wait(out.id, Duration::from_millis(300)).await.unwrap();
    assert_eq!(result, None);

    pm.kill(out.id).await.unwrap();
    let result = pm.wait(out.id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(result, Some(128 + libc::SIGKILL));

    // Signalling a group that is gone is not an error.
    pm.shutdown(out.id).await.unwrap();
}
