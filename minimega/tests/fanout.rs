use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use minimega::handlers::{self, Context};
use minimega::meshage::{Config, Node};
use minimega::minicli::Registry;
use minimega::plumber::Plumber;
use minimega::{iomeshage, ron};

struct Daemon {
    registry: std::sync::Arc<Registry>,
    node: Node,
    _base: TempDir,
}

/// A full in-process daemon: mesh node, file layer, agent server,
/// handler registry
async fn daemon(name: &str) -> (Daemon, std::net::SocketAddr) {
    let base = TempDir::new().unwrap();

    let config = Config::new(name)
        .with_msa_period(Duration::from_millis(200))
        .with_timeout(Duration::from_secs(3));
    let node = Node::new(config);
    let addr = node.listen("127.0.0.1:0").await.unwrap();

    let iom = iomeshage::Iom::with_timeout(
        node.clone(),
        base.path().join("files"),
        Duration::from_secs(3),
    )
    .unwrap();
    let agents = ron::Server::new(base.path()).unwrap();
    let plumber = Plumber::new();

    let ctx = Context::new(node.clone(), iom, agents, plumber);
    let registry = handlers::build(ctx).unwrap();

    (
        Daemon {
            registry,
            node,
            _base: base,
        },
        addr,
    )
}

async fn run_command(daemon: &Daemon, input: &str) -> Vec<minimega::minicli::Response> {
    let mut rx = daemon.registry.exec_string(input).unwrap().unwrap();

    let mut responses = Vec::new();
    while let Some(bundle) = rx.recv().await {
        responses.extend(bundle);
    }
    responses
}

#[tokio::test]
async fn fan_out_yields_one_response_per_peer() {
    let (a, _a_addr) = daemon("a").await;
    let (b, b_addr) = daemon("b").await;
    let (c, c_addr) = daemon("c").await;

    a.node.dial(b_addr).await.unwrap();
    b.node.dial(c_addr).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    let responses = run_command(&a, "mesh send all version").await;

    let mut hosts: Vec<&str> = responses.iter().map(|r| r.host.as_str()).collect();
    hosts.sort();
    assert_eq!(hosts, vec!["b", "c"]);

    for r in &responses {
        assert_eq!(r.error, "");
        assert!(!r.response.is_empty());
    }

    let _ = c;
}

#[tokio::test]
async fn fan_out_reports_unreachable_hosts_inline() {
    let (a, _) = daemon("a").await;
    let (b, b_addr) = daemon("b").await;

    a.node.dial(b_addr).await.unwrap();
    sleep(Duration::from_millis(400)).await;

    let responses = run_command(&a, "mesh send kn[1-2],b version").await;

    // one response per targeted host, reachable or not
    assert_eq!(responses.len(), 3);

    let ok: Vec<&str> = responses
        .iter()
        .filter(|r| r.error.is_empty())
        .map(|r| r.host.as_str())
        .collect();
    assert_eq!(ok, vec!["b"]);

    let mut failed: Vec<&str> = responses
        .iter()
        .filter(|r| !r.error.is_empty())
        .map(|r| r.host.as_str())
        .collect();
    failed.sort();
    assert_eq!(failed, vec!["kn1", "kn2"]);
}

#[tokio::test]
async fn remote_command_runs_remote_handlers() {
    let (a, _) = daemon("a").await;
    let (b, b_addr) = daemon("b").await;

    a.node.dial(b_addr).await.unwrap();
    sleep(Duration::from_millis(400)).await;

    let responses = run_command(&a, "mesh send b host").await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].host, "b");
    assert_eq!(responses[0].header[0], "name");
    assert_eq!(responses[0].tabular[0][0], "b");
}

#[tokio::test]
async fn local_handlers_answer_directly() {
    let (a, _) = daemon("a").await;

    let responses = run_command(&a, "mesh status").await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].tabular[0][0], "a");

    let responses = run_command(&a, "version").await;
    assert_eq!(responses[0].response, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn pipe_commands_flow_through_the_plumber() {
    let (a, _) = daemon("a").await;

    run_command(&a, "pipe events first message").await;

    let responses = run_command(&a, "pipe").await;
    assert_eq!(responses.len(), 1);

    let row = &responses[0].tabular[0];
    assert_eq!(row[0], "events");
    assert_eq!(row[3], "1");
    assert_eq!(row[4], "first message");
}
