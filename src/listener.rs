//! 연결 다중화 리스너
//!
//! 소켓 하나로 여러 피어를 받는다. 수신 루프가 데이터그램의 출발 주소
//! ("ip:port")로 연결을 찾고, 없으면 새로 만들어 accept 큐에 넣는다.
//! 서버측 연결은 리스너 소켓으로 응답한다.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AcceptOrder;
use crate::connection::{Connection, Mode};
use crate::transport::{address_key, bind_socket, recv_from_with_timeout};
use crate::{Config, Error, Result};

/// 주소별 연결 + accept 대기 큐 (같은 락으로 보호)
#[derive(Default)]
struct Registry {
    peers: HashMap<String, Connection>,
    pending: VecDeque<Connection>,
}

struct ListenerInner {
    socket: Arc<UdpSocket>,
    mode: Mode,
    config: Config,
    registry: Mutex<Registry>,
    incoming: Notify,
    closed: watch::Sender<bool>,
    read_timeout: Mutex<Option<Duration>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerInner {
    /// 데이터그램을 출발 주소의 연결로 전달
    fn dispatch(&self, from: SocketAddr, datagram: Bytes) {
        let key = address_key(&from);

        let (conn, created) = {
            let mut registry = self.registry.lock();
            match registry.peers.get(&key) {
                Some(conn) => (conn.clone(), false),
                None => {
                    let conn = Connection::for_listener(
                        from,
                        self.mode,
                        self.config.clone(),
                        self.socket.clone(),
                    );
                    registry.peers.insert(key.clone(), conn.clone());
                    registry.pending.push_back(conn.clone());
                    (conn, true)
                }
            }
        };

        if created {
            debug!("새 피어 {} (연결 {})", key, conn.id());
            self.incoming.notify_waiters();
        }

        if !conn.deliver(datagram) {
            // 닫힌 연결: 다음 데이터그램부터 새 연결
            let mut registry = self.registry.lock();
            if registry.peers.get(&key).is_some_and(|c| c.id() == conn.id()) {
                registry.peers.remove(&key);
                debug!("닫힌 연결 {} 제거: {}", conn.id(), key);
            }
        }
    }

    fn pop_pending(&self) -> Option<Connection> {
        let mut registry = self.registry.lock();
        loop {
            let conn = match self.config.accept_order {
                AcceptOrder::Lifo => registry.pending.pop_back(),
                AcceptOrder::Fifo => registry.pending.pop_front(),
            }?;
            if !conn.is_closed() {
                return Some(conn);
            }
        }
    }

    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        let connections: Vec<Connection> = {
            let mut registry = self.registry.lock();
            registry.pending.clear();
            registry.peers.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &connections {
            conn.close();
        }

        self.incoming.notify_waiters();
        info!(
            "리스너 종료: {:?} (연결 {}개 정리)",
            self.socket.local_addr().ok(),
            connections.len()
        );
    }
}

/// 연결 다중화 리스너
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// 소켓 바인딩 (수신 루프는 [`Listener::start`]에서 시작)
    pub async fn bind<A: ToSocketAddrs>(addr: A, mode: Mode, config: Config) -> Result<Self> {
        config.validate()?;

        let addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::AddrResolve("바인드 주소 없음".into()))?;
        let socket = Arc::new(bind_socket(addr, &config)?);
        let (closed, _) = watch::channel(false);

        info!("리스너 바인딩: {} ({:?})", socket.local_addr()?, mode);

        Ok(Self {
            inner: Arc::new(ListenerInner {
                socket,
                mode,
                config,
                registry: Mutex::new(Registry::default()),
                incoming: Notify::new(),
                closed,
                read_timeout: Mutex::new(None),
                task: Mutex::new(None),
            }),
        })
    }

    /// 바인딩 후 바로 수신 시작
    pub async fn listen<A: ToSocketAddrs>(addr: A, mode: Mode, config: Config) -> Result<Self> {
        let listener = Self::bind(addr, mode, config).await?;
        listener.start()?;
        Ok(listener)
    }

    /// 수신 루프 시작 (여러 번 호출해도 한 번만 시작)
    pub fn start(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ListenerClosed);
        }

        let mut task = self.inner.task.lock();
        if task.is_none() {
            *task = Some(spawn_receive_loop(
                Arc::downgrade(&self.inner),
                self.inner.socket.clone(),
            ));
        }
        Ok(())
    }

    /// 새 피어 연결 대기
    ///
    /// 기본은 가장 최근 피어부터 (`AcceptOrder::Lifo`).
    pub async fn accept(&self) -> Result<Connection> {
        let inner = &self.inner;
        let mut closed = inner.closed.subscribe();

        loop {
            let notified = inner.incoming.notified();
            tokio::pin!(notified);
            // 큐 확인 전에 등록해야 그 사이의 알림을 놓치지 않음
            notified.as_mut().enable();

            if *closed.borrow_and_update() {
                return Err(Error::ListenerClosed);
            }
            if let Some(conn) = inner.pop_pending() {
                info!("연결 수락: {} (연결 {})", conn.remote_full_addr(), conn.id());
                return Ok(conn);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = closed.changed() => {}
            }
        }
    }

    /// 리스너 종료
    ///
    /// 수신 루프를 멈추고 등록된 모든 연결을 닫는다. 대기 중인 accept는
    /// `ListenerClosed`로 깨어난다.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.local_addr()?.port())
    }

    /// 열려 있는 연결 수
    pub fn connection_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .peers
            .values()
            .filter(|conn| !conn.is_closed())
            .count()
    }

    /// 수신 루프 읽기 타임아웃 (다음 읽기부터 적용)
    ///
    /// 시간 내 데이터그램이 없으면 리스너를 닫는다.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.inner.read_timeout.lock() = timeout;
    }

    /// SO_BROADCAST
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        Ok(self.inner.socket.set_broadcast(on)?)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

fn spawn_receive_loop(inner: Weak<ListenerInner>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_datagram = match inner.upgrade() {
            Some(inner) => inner.config.max_datagram_size,
            None => return,
        };
        let mut buf = vec![0u8; max_datagram];

        loop {
            let timeout = match inner.upgrade() {
                Some(inner) => *inner.read_timeout.lock(),
                None => break,
            };

            let result = recv_from_with_timeout(&socket, &mut buf, timeout).await;

            let Some(inner) = inner.upgrade() else {
                break;
            };

            match result {
                Ok((len, from)) => inner.dispatch(from, Bytes::copy_from_slice(&buf[..len])),
                Err(e) => {
                    warn!("리스너 수신 에러, 종료: {}", e);
                    inner.shutdown();
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn raw_listener(config: Config) -> Listener {
        Listener::listen("127.0.0.1:0", Mode::Raw, config).await.unwrap()
    }

    async fn client_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_routes_by_source_address() {
        let listener = raw_listener(Config::default()).await;
        let target = listener.local_addr().unwrap();

        let first = client_socket().await;
        let second = client_socket().await;
        first.send_to(b"from first", target).await.unwrap();
        settle().await;
        second.send_to(b"from second", target).await.unwrap();
        settle().await;

        // LIFO: 나중에 온 피어가 먼저
        let a = listener.accept().await.unwrap();
        let b = listener.accept().await.unwrap();
        assert_eq!(a.remote_port(), second.local_addr().unwrap().port());
        assert_eq!(b.remote_port(), first.local_addr().unwrap().port());
        assert_ne!(a.id(), b.id());
        assert_eq!(listener.connection_count(), 2);

        assert_eq!(a.recv().await.unwrap().as_ref(), b"from second");
        assert_eq!(b.recv().await.unwrap().as_ref(), b"from first");
    }

    #[tokio::test]
    async fn test_fifo_accept_order() {
        let config = Config {
            accept_order: AcceptOrder::Fifo,
            ..Config::default()
        };
        let listener = raw_listener(config).await;
        let target = listener.local_addr().unwrap();

        let first = client_socket().await;
        let second = client_socket().await;
        first.send_to(b"1", target).await.unwrap();
        settle().await;
        second.send_to(b"2", target).await.unwrap();
        settle().await;

        let a = listener.accept().await.unwrap();
        assert_eq!(a.remote_port(), first.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_repeated_datagrams_share_connection() {
        let listener = raw_listener(Config::default()).await;
        let target = listener.local_addr().unwrap();
        let client = client_socket().await;

        for msg in [&b"one"[..], b"two", b"three"] {
            client.send_to(msg, target).await.unwrap();
        }

        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.recv().await.unwrap().as_ref(), b"one");
        assert_eq!(conn.recv().await.unwrap().as_ref(), b"two");
        assert_eq!(conn.recv().await.unwrap().as_ref(), b"three");
        assert_eq!(listener.connection_count(), 1);
        assert_eq!(conn.local_addr().unwrap(), target);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced() {
        let listener = raw_listener(Config::default()).await;
        let target = listener.local_addr().unwrap();
        let client = client_socket().await;

        client.send_to(b"hello", target).await.unwrap();
        let old = listener.accept().await.unwrap();
        old.close();

        // 닫힌 연결로 온 데이터그램은 버려지고 주소가 레지스트리에서 빠짐
        client.send_to(b"dropped", target).await.unwrap();
        client.send_to(b"again", target).await.unwrap();

        let fresh = listener.accept().await.unwrap();
        assert_ne!(fresh.id(), old.id());
        assert_eq!(fresh.recv().await.unwrap().as_ref(), b"again");
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let listener = Arc::new(raw_listener(Config::default()).await);
        let target = listener.local_addr().unwrap();

        let client = client_socket().await;
        client.send_to(b"x", target).await.unwrap();
        let accepted = listener.accept().await.unwrap();

        let waiting = listener.clone();
        let pending = tokio::spawn(async move { waiting.accept().await });
        settle().await;

        listener.close();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept must wake")
            .unwrap();
        assert!(matches!(result, Err(Error::ListenerClosed)));
        assert!(accepted.is_closed());
        assert!(listener.is_closed());
        assert!(matches!(listener.start(), Err(Error::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_read_timeout_closes_listener() {
        let listener = Listener::bind("127.0.0.1:0", Mode::Raw, Config::default())
            .await
            .unwrap();
        listener.set_read_timeout(Some(Duration::from_millis(30)));
        listener.start().unwrap();
        listener.start().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .expect("accept must wake");
        assert!(matches!(result, Err(Error::ListenerClosed)));
    }
}
