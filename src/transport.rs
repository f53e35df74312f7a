//! 송신 경로 추상화와 UDP 소켓 생성
//!
//! 연결은 "고정된 목적지로 이 바이트를 보낸다"는 좁은 기능만 주입받는다.
//! 클라이언트 연결은 자기 소켓을, 서버 연결은 리스너의 공유 소켓을 쓰지만
//! 신뢰성 로직은 동일하다.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::Config;

/// Send 가능한 박스 퓨처
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 고정 목적지 송신 경로
pub trait Outbound: Send + Sync {
    /// 데이터그램 하나를 목적지로 전송
    fn send(&self, datagram: Bytes) -> BoxFuture<'_, io::Result<()>>;
}

/// UDP 소켓 송신 경로
#[derive(Debug, Clone)]
pub struct UdpOutbound {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpOutbound {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Outbound for UdpOutbound {
    fn send(&self, datagram: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.socket.send_to(&datagram, self.peer).await?;
            Ok(())
        })
    }
}

/// 설정을 적용한 UDP 소켓 바인딩
pub fn bind_socket(addr: SocketAddr, config: &Config) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(config.recv_buffer_size)?;
    socket.set_broadcast(config.broadcast)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// 피어 주소에 맞는 임시 포트 로컬 주소
pub fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    let ip: IpAddr = match peer {
        SocketAddr::V4(_) => IpAddr::from([0u8; 4]),
        SocketAddr::V6(_) => IpAddr::from([0u16; 8]),
    };
    SocketAddr::new(ip, 0)
}

/// 레지스트리 키 ("ip:port")
pub fn address_key(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

/// 읽기 타임아웃을 적용한 recv_from
///
/// 타임아웃은 `TimedOut` I/O 에러로 돌려준다.
pub async fn recv_from_with_timeout(
    socket: &UdpSocket,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<(usize, SocketAddr)> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, socket.recv_from(buf))
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{}ms 동안 데이터그램 없음", limit.as_millis()),
                ))
            }),
        None => socket.recv_from(buf).await,
    }
}
