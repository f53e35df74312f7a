//! 실제 UDP 소켓(127.0.0.1)으로 클라이언트와 다중화 리스너를 연결하는 테스트

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use nackudp::{Config, Connection, Error, Listener, Mode};

fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

fn test_config() -> Config {
    Config {
        recv_buffer_size: 1024 * 1024,
        ..Config::low_latency()
    }
}

fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ salt).collect()
}

async fn start(mode: Mode) -> (Listener, Connection) {
    let listener = Listener::listen("127.0.0.1:0", mode, test_config())
        .await
        .unwrap();
    let port = listener.local_port().unwrap();
    let client = Connection::connect("127.0.0.1", port, mode, test_config())
        .await
        .unwrap();
    (listener, client)
}

#[tokio::test]
async fn reliable_echo_round_trip() {
    init_tracing();
    let (listener, client) = start(Mode::Reliable).await;

    let sizes = [0usize, 1, 1467, 1468, 200 * 1024];
    let expected = sizes.len();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await?;
        for _ in 0..expected {
            let message = conn.recv().await?;
            conn.send(&message).await?;
        }
        Ok::<_, Error>((listener, conn))
    });

    for (salt, size) in sizes.into_iter().enumerate() {
        let data = pattern(size, salt as u8);
        client.send(&data).await.unwrap();
        let echoed = client.recv().await.unwrap();
        assert_eq!(echoed.as_ref(), &data[..], "size {size}");
    }

    let (listener, conn) = server.await.unwrap().unwrap();
    // 같은 주소의 데이터그램은 모두 같은 연결로 전달됨
    assert_eq!(listener.connection_count(), 1);
    assert_eq!(conn.remote_addr().port(), client.local_addr().unwrap().port());
    assert_eq!(conn.stats().messages_received, expected as u64);
    assert_eq!(client.stats().messages_sent, expected as u64);
}

#[tokio::test]
async fn two_clients_get_distinct_connections() {
    init_tracing();
    let (listener, first) = start(Mode::Reliable).await;
    let port = listener.local_port().unwrap();
    let second = Connection::connect("127.0.0.1", port, Mode::Reliable, test_config())
        .await
        .unwrap();

    let (sent, received) = tokio::join!(first.send(b"alpha"), async {
        let conn = listener.accept().await?;
        let message = conn.recv().await?;
        Ok::<_, Error>((conn, message))
    });
    sent.unwrap();
    let (conn_a, message_a) = received.unwrap();

    let (sent, received) = tokio::join!(second.send(b"beta"), async {
        let conn = listener.accept().await?;
        let message = conn.recv().await?;
        Ok::<_, Error>((conn, message))
    });
    sent.unwrap();
    let (conn_b, message_b) = received.unwrap();

    assert_eq!(message_a.as_ref(), b"alpha");
    assert_eq!(message_b.as_ref(), b"beta");
    assert_ne!(conn_a.id(), conn_b.id());
    assert_eq!(conn_a.remote_port(), first.local_addr().unwrap().port());
    assert_eq!(conn_b.remote_port(), second.local_addr().unwrap().port());
    assert_eq!(listener.connection_count(), 2);
}

#[tokio::test]
async fn raw_mode_round_trip() {
    init_tracing();
    let (listener, client) = start(Mode::Raw).await;

    client.send(b"ping").await.unwrap();
    let conn = listener.accept().await.unwrap();
    assert_eq!(conn.recv().await.unwrap().as_ref(), b"ping");

    conn.send(b"pong").await.unwrap();
    assert_eq!(client.recv().await.unwrap().as_ref(), b"pong");
    assert_eq!(client.stats().reports_received, 0);
}

#[tokio::test]
async fn listener_close_closes_accepted_connections() {
    init_tracing();
    let (listener, client) = start(Mode::Raw).await;

    client.send(b"hello").await.unwrap();
    let conn = listener.accept().await.unwrap();

    listener.close();
    assert!(matches!(conn.recv().await, Err(Error::ConnectionClosed)));
    assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));
    assert!(matches!(
        conn.set_read_timeout(Some(Duration::from_secs(1))),
        Err(Error::SharedSocket)
    ));
}

#[tokio::test]
async fn client_read_timeout_closes_connection() {
    init_tracing();
    let (listener, client) = start(Mode::Raw).await;

    client.set_read_timeout(Some(Duration::from_millis(30))).unwrap();
    // 타임아웃은 다음 읽기부터 적용되므로 응답 하나로 진행 중인 읽기를 끝냄
    client.send(b"wake").await.unwrap();
    let conn = listener.accept().await.unwrap();
    conn.send(b"ack").await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "read timeout must close the connection");
    assert!(matches!(client.recv().await, Err(Error::ConnectionClosed)));
}
