use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use minimega_tunnel::Tunnel;

/// Two tunnel ends joined by plain channels, as the agent channel would
/// join them in production
fn joined_pair() -> (Tunnel, Tunnel) {
    let (a_out, b_in) = mpsc::channel(64);
    let (b_out, a_in) = mpsc::channel(64);

    (Tunnel::new(a_out, a_in), Tunnel::new(b_out, b_in))
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

#[tokio::test]
async fn forward_tunnel_proxies_tcp() {
    let (local, _remote) = joined_pair();
    let echo_port = echo_server().await;

    // connections to the local port come out of the remote end
    let port = local.forward(0, "127.0.0.1", echo_port).await.unwrap();

    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    conn.write_all(b"through the tunnel").await.unwrap();

    let mut buf = vec![0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"through the tunnel");
}

#[tokio::test]
async fn tunnel_survives_multiple_connections() {
    let (local, _remote) = joined_pair();
    let echo_port = echo_server().await;

    let port = local.forward(0, "127.0.0.1", echo_port).await.unwrap();

    for round in 0..3u8 {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let payload = vec![round; 128];
        conn.write_all(&payload).await.unwrap();

        let mut got = vec![0u8; 128];
        conn.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);
    }
}

#[tokio::test]
async fn reverse_asks_the_far_side_to_listen() {
    let (local, _remote) = joined_pair();
    let echo_port = echo_server().await;

    // pick a port the remote end can bind
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_port = probe.local_addr().unwrap().port();
    drop(probe);

    local
        .reverse(remote_port, "127.0.0.1", echo_port)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut conn = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
    conn.write_all(b"backwards").await.unwrap();

    let mut buf = vec![0u8; 16];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"backwards");
}
