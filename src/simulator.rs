//! 장애 주입 네트워크 시뮬레이터
//!
//! 실제 네트워크는 패킷을 버리고, 순서를 바꾸고, 중복시킨다.
//! 신뢰성 로직을 네트워크 상태와 무관하게 검증하기 위해 송신 경로를
//! 감싸서 손실/중복/순서 뒤바꿈을 주입한다. 시드 고정 RNG를 쓰므로
//! 같은 설정이면 같은 결과가 나온다.
//!
//! | 장애 | 설명 |
//! |------|------|
//! | 손실 | `loss_rate` 확률로 버림 |
//! | 순서 | `reorder_rate` 확률로 잡아뒀다가 다음 데이터그램 뒤에 전송 |
//! | 중복 | `duplicate_rate` 확률로 두 번 전송 |
//! | 지정 손실 | `scripted_drops`에 있는 순번(0부터)의 데이터그램은 항상 버림 |

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::connection::{Connection, Mode};
use crate::frame::FrameType;
use crate::transport::{BoxFuture, Outbound};
use crate::{Config, Result};

/// 장애 모델 설정
///
/// 확률은 모두 `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,

    /// RNG 시드
    pub seed: u64,

    /// END/REPORT 프레임은 손실/중복/순서 장애에서 제외
    /// (지정 손실은 그대로 적용)
    pub protect_boundaries: bool,

    /// 항상 버릴 데이터그램 순번
    pub scripted_drops: Vec<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // 장애 없음: 그대로 통과
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0x5eed,
            protect_boundaries: false,
            scripted_drops: Vec::new(),
        }
    }
}

impl FaultConfig {
    /// 경계 프레임을 보호하는 단순 손실 모델
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed,
            protect_boundaries: true,
            ..Self::default()
        }
    }
}

/// 장애 주입 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

struct FaultState {
    rng: StdRng,
    ordinal: u64,
    held: Option<Bytes>,
    stats: FaultStats,
}

/// 장애를 주입하는 송신 경로 래퍼
///
/// 순서 장애로 잡아둔 데이터그램은 다음 데이터그램이 지나갈 때 함께 나간다.
pub struct FaultyOutbound {
    inner: Arc<dyn Outbound>,
    config: FaultConfig,
    state: Mutex<FaultState>,
}

impl FaultyOutbound {
    pub fn new(inner: Arc<dyn Outbound>, config: FaultConfig) -> Self {
        let state = FaultState {
            rng: StdRng::seed_from_u64(config.seed),
            ordinal: 0,
            held: None,
            stats: FaultStats::default(),
        };
        Self {
            inner,
            config,
            state: Mutex::new(state),
        }
    }

    pub fn stats(&self) -> FaultStats {
        self.state.lock().stats
    }

    /// 이번 데이터그램으로 실제 내보낼 목록 결정
    fn plan(&self, datagram: Bytes) -> Vec<Bytes> {
        let config = &self.config;
        let mut state = self.state.lock();
        let ordinal = state.ordinal;
        state.ordinal += 1;

        if config.scripted_drops.contains(&ordinal) {
            state.stats.dropped += 1;
            return Vec::new();
        }

        let exposed = !(config.protect_boundaries && is_boundary(&datagram));

        if exposed && chance(&mut state.rng, config.loss_rate) {
            state.stats.dropped += 1;
            return Vec::new();
        }

        if exposed && state.held.is_none() && chance(&mut state.rng, config.reorder_rate) {
            state.stats.reordered += 1;
            state.held = Some(datagram);
            return Vec::new();
        }

        let mut out = vec![datagram.clone()];
        if exposed && chance(&mut state.rng, config.duplicate_rate) {
            state.stats.duplicated += 1;
            out.push(datagram);
        }
        if let Some(held) = state.held.take() {
            out.push(held);
        }

        state.stats.forwarded += out.len() as u64;
        out
    }
}

impl Outbound for FaultyOutbound {
    fn send(&self, datagram: Bytes) -> BoxFuture<'_, io::Result<()>> {
        let planned = self.plan(datagram);
        Box::pin(async move {
            for datagram in planned {
                self.inner.send(datagram).await?;
            }
            Ok(())
        })
    }
}

fn chance(rng: &mut StdRng, probability: f64) -> bool {
    probability > 0.0 && rng.gen_bool(probability.min(1.0))
}

fn is_boundary(datagram: &[u8]) -> bool {
    matches!(
        datagram.first().map(|&code| FrameType::from(code)),
        Some(FrameType::End | FrameType::Report)
    )
}

/// 메모리 채널 송신 경로
struct ChannelOutbound {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Outbound for ChannelOutbound {
    fn send(&self, datagram: Bytes) -> BoxFuture<'_, io::Result<()>> {
        let result = self
            .tx
            .send(datagram)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "상대 연결 종료"));
        Box::pin(async move { result })
    }
}

/// 메모리로 연결된 연결 쌍
pub struct LoopbackPair {
    pub a: Connection,
    pub b: Connection,

    /// a -> b 경로
    pub a_link: Arc<FaultyOutbound>,

    /// b -> a 경로
    pub b_link: Arc<FaultyOutbound>,
}

/// 소켓 없이 두 연결을 잇는다 (tokio 런타임 안에서 호출)
pub fn loopback_pair(
    mode: Mode,
    config: Config,
    a_to_b: FaultConfig,
    b_to_a: FaultConfig,
) -> Result<LoopbackPair> {
    let a_addr: SocketAddr = ([127, 0, 0, 1], 40001).into();
    let b_addr: SocketAddr = ([127, 0, 0, 1], 40002).into();

    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a_link = Arc::new(FaultyOutbound::new(Arc::new(ChannelOutbound { tx: a_tx }), a_to_b));
    let b_link = Arc::new(FaultyOutbound::new(Arc::new(ChannelOutbound { tx: b_tx }), b_to_a));

    let a = Connection::with_outbound(b_addr, mode, config.clone(), a_link.clone())?;
    let b = Connection::with_outbound(a_addr, mode, config, b_link.clone())?;

    spawn_pump(a_rx, b.clone());
    spawn_pump(b_rx, a.clone());

    Ok(LoopbackPair { a, b, a_link, b_link })
}

fn spawn_pump(mut rx: mpsc::UnboundedReceiver<Bytes>, peer: Connection) {
    tokio::spawn(async move {
        while let Some(datagram) = rx.recv().await {
            if !peer.deliver(datagram) {
                break;
            }
        }
    });
}
