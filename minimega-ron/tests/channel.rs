use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use minimega_ron::{Client, ClientConfig, CommandKind, Filter, Server};

fn quick_client(uuid: &str, workdir: &std::path::Path) -> ClientConfig {
    ClientConfig::new()
        .with_uuid(uuid)
        .with_hostname(format!("guest-{uuid}"))
        .with_workdir(workdir)
        .with_heartbeat(Duration::from_millis(200))
}

async fn wait_for<F: Fn() -> bool>(cond: F, max: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn exec_round_trip_with_matching_filter() {
    let base = TempDir::new().unwrap();
    let guest = TempDir::new().unwrap();

    let server = Server::with_expire(base.path(), Duration::from_secs(5)).unwrap();
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Client::dial_tcp(addr, quick_client("u-echo", guest.path()))
        .await
        .unwrap();

    assert!(wait_for(|| !server.sessions().is_empty(), Duration::from_secs(2)).await);

    let filter = Filter {
        uuid: "u-echo".into(),
        ..Default::default()
    };
    let id = server
        .exec(
            vec![filter],
            CommandKind::Exec {
                argv: vec!["/bin/echo".into(), "hi".into()],
                env: vec![],
                dir: String::new(),
                stdin: String::new(),
                background: false,
            },
        )
        .await
        .unwrap();

    // the response arrives with a heartbeat
    assert!(
        wait_for(
            || !server.responses(id).is_empty(),
            Duration::from_secs(3)
        )
        .await
    );

    let responses = server.responses(id);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0, client.uuid());
    assert_eq!(responses[0].1.stdout, "hi\n");
    assert_eq!(responses[0].1.stderr, "");
    assert_eq!(responses[0].1.exit, 0);
}

#[tokio::test]
async fn non_matching_filter_is_ignored() {
    let base = TempDir::new().unwrap();
    let guest = TempDir::new().unwrap();

    let server = Server::with_expire(base.path(), Duration::from_secs(5)).unwrap();
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let _client = Client::dial_tcp(addr, quick_client("u-other", guest.path()))
        .await
        .unwrap();
    assert!(wait_for(|| !server.sessions().is_empty(), Duration::from_secs(2)).await);

    let filter = Filter {
        uuid: "somebody-else".into(),
        ..Default::default()
    };
    let id = server
        .exec(
            vec![filter],
            CommandKind::Exec {
                argv: vec!["/bin/echo".into(), "nope".into()],
                env: vec![],
                dir: String::new(),
                stdin: String::new(),
                background: false,
            },
        )
        .await
        .unwrap();

    sleep(Duration::from_millis(600)).await;
    assert!(server.responses(id).is_empty());
}

#[tokio::test]
async fn malformed_cidr_filters_fail_at_submission() {
    let base = TempDir::new().unwrap();
    let server = Server::with_expire(base.path(), Duration::from_secs(5)).unwrap();

    let bad = Filter {
        ip: "10.0.0.0/99".into(),
        ..Default::default()
    };
    assert!(server.exec(vec![bad], CommandKind::Quit).await.is_err());
}

#[tokio::test]
async fn tags_and_heartbeats_reach_the_session() {
    let base = TempDir::new().unwrap();
    let guest = TempDir::new().unwrap();

    let server = Server::with_expire(base.path(), Duration::from_secs(5)).unwrap();
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Client::dial_tcp(addr, quick_client("u-tags", guest.path()))
        .await
        .unwrap();
    client.set_tag("role", "router");

    assert!(
        wait_for(
            || {
                server
                    .sessions()
                    .first()
                    .map(|s| s.tags.get("role").map(String::as_str) == Some("router"))
                    .unwrap_or(false)
            },
            Duration::from_secs(2)
        )
        .await
    );

    let sessions = server.sessions();
    assert_eq!(sessions[0].hostname, "guest-u-tags");
    assert!(sessions[0].active);
}

#[tokio::test]
async fn silent_clients_are_reaped_and_responses_flushed() {
    let base = TempDir::new().unwrap();
    let guest = TempDir::new().unwrap();

    let server = Server::with_expire(base.path(), Duration::from_millis(800)).unwrap();
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Client::dial_tcp(addr, quick_client("u-reap", guest.path()))
        .await
        .unwrap();
    assert!(wait_for(|| !server.sessions().is_empty(), Duration::from_secs(2)).await);

    let id = server
        .exec(
            vec![],
            CommandKind::Exec {
                argv: vec!["/bin/echo".into(), "flushed".into()],
                env: vec![],
                dir: String::new(),
                stdin: String::new(),
                background: false,
            },
        )
        .await
        .unwrap();
    assert!(
        wait_for(
            || !server.responses(id).is_empty(),
            Duration::from_secs(3)
        )
        .await
    );

    // silence the guest; the reaper marks it inactive and flushes
    client.close();
    assert!(
        wait_for(
            || server.sessions().first().map(|s| !s.active).unwrap_or(false),
            Duration::from_secs(5)
        )
        .await
    );

    let flushed = base
        .path()
        .join("responses")
        .join(id.to_string())
        .join("u-reap")
        .join("stdout");
    assert!(
        wait_for(|| flushed.exists(), Duration::from_secs(3)).await,
        "expected flushed stdout at {flushed:?}"
    );
    assert_eq!(std::fs::read_to_string(flushed).unwrap(), "flushed\n");
}

#[tokio::test]
async fn files_stage_in_and_out_of_guests() {
    let base = TempDir::new().unwrap();
    let guest = TempDir::new().unwrap();
    // stands in for the mesh file base the daemon wires in
    let files = TempDir::new().unwrap();

    let server = Server::with_expire(base.path(), Duration::from_secs(5)).unwrap();
    server.set_files_root(files.path());
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Client::dial_tcp(addr, quick_client("u-files", guest.path()))
        .await
        .unwrap();
    assert!(wait_for(|| !server.sessions().is_empty(), Duration::from_secs(2)).await);

    // stage a file into the guest
    std::fs::write(files.path().join("payload.conf"), b"tuned = true").unwrap();
    server
        .exec(
            vec![],
            CommandKind::FilesSend(vec!["payload.conf".into()]),
        )
        .await
        .unwrap();

    let staged = guest.path().join("payload.conf");
    assert!(wait_for(|| staged.exists(), Duration::from_secs(3)).await);
    assert_eq!(std::fs::read(&staged).unwrap(), b"tuned = true");

    // pull a file out of the guest; it lands under the guest's uuid
    std::fs::write(guest.path().join("result.log"), b"finished").unwrap();
    server
        .exec(vec![], CommandKind::FilesRecv(vec!["result.log".into()]))
        .await
        .unwrap();

    let pulled = files.path().join("u-files").join("result.log");
    assert!(wait_for(|| pulled.exists(), Duration::from_secs(3)).await);
    assert_eq!(std::fs::read(&pulled).unwrap(), b"finished");

    let _ = client;
}

#[tokio::test]
async fn log_reconfiguration_reaches_the_handler() {
    let base = TempDir::new().unwrap();
    let guest = TempDir::new().unwrap();

    let server = Server::with_expire(base.path(), Duration::from_secs(5)).unwrap();
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Client::dial_tcp(addr, quick_client("u-log", guest.path()))
        .await
        .unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
    let sink = seen.clone();
    client.on_log(move |level, path| {
        *sink.lock().unwrap() = Some((level.to_string(), path.to_string()));
    });

    assert!(wait_for(|| !server.sessions().is_empty(), Duration::from_secs(2)).await);

    server
        .exec(
            vec![],
            CommandKind::Log {
                level: "debug".into(),
                path: "/tmp/agent.log".into(),
            },
        )
        .await
        .unwrap();

    assert!(wait_for(|| seen.lock().unwrap().is_some(), Duration::from_secs(3)).await);
    assert_eq!(
        seen.lock().unwrap().clone(),
        Some(("debug".to_string(), "/tmp/agent.log".to_string()))
    );
}

#[tokio::test]
async fn quit_resolves_wait() {
    let base = TempDir::new().unwrap();
    let guest = TempDir::new().unwrap();

    let server = Server::with_expire(base.path(), Duration::from_secs(5)).unwrap();
    let addr = server.listen_tcp("127.0.0.1:0").await.unwrap();

    let client = Client::dial_tcp(addr, quick_client("u-quit", guest.path()))
        .await
        .unwrap();
    assert!(wait_for(|| !server.sessions().is_empty(), Duration::from_secs(2)).await);

    server.exec(vec![], CommandKind::Quit).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), client.wait())
        .await
        .expect("quit should resolve wait()");
}
