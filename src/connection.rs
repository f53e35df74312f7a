//! 피어 연결
//!
//! - reliable 모드: 메시지를 프레임으로 나눠 한 번에 전송하고, 수신자가
//!   리포트로 알려준 누락 프레임만 다시 보낸다 (NACK)
//! - raw 모드: 헤더 없이 청크 단위로 그대로 전송, 복구 없음
//!
//! 수신 데이터그램은 백그라운드 태스크(클라이언트) 또는 리스너가
//! [`Connection::deliver`]로 넣어준다. 송신은 주입된 [`Outbound`]로만 한다.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::frame::{parse_missing, split_message, Frame, FrameType};
use crate::reassembly::ReassemblyBuffer;
use crate::stats::{StatsRecorder, TransferStats};
use crate::timer::DeadlineTimer;
use crate::transport::{
    bind_socket, recv_from_with_timeout, unspecified_for, Outbound, UdpOutbound,
};
use crate::{Config, Error, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 연결 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 순서 복원 + 누락 프레임 재요청
    Reliable,
    /// 데이터그램 그대로 통과
    Raw,
}

/// 연결 내부 상태 (핸들끼리 공유)
struct Inner {
    id: u64,
    peer: SocketAddr,
    mode: Mode,
    config: Config,
    outbound: Arc<dyn Outbound>,

    /// 클라이언트는 자기 소켓, 서버 연결은 리스너 소켓
    socket: Option<Arc<UdpSocket>>,
    owns_socket: bool,

    /// 수신 프레임 (도착 순서)
    frames_tx: mpsc::UnboundedSender<Frame>,
    frames_rx: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,

    /// 리포트 프레임은 별도 채널로 받음
    reports_tx: mpsc::UnboundedSender<Frame>,
    reports_rx: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,

    /// raw 모드 청크
    raw_tx: mpsc::UnboundedSender<Bytes>,
    raw_rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,

    /// 동시 send() 직렬화
    send_lock: AsyncMutex<()>,

    closed: watch::Sender<bool>,
    read_timeout: Mutex<Option<Duration>>,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
    stats: StatsRecorder,
}

impl Inner {
    /// close() 될 때까지 대기
    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.receiver_task.get_mut().take() {
            task.abort();
        }
    }
}

/// 피어 연결 핸들
///
/// 복제해도 같은 연결을 가리킨다.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    fn build(
        peer: SocketAddr,
        mode: Mode,
        config: Config,
        outbound: Arc<dyn Outbound>,
        socket: Option<Arc<UdpSocket>>,
        owns_socket: bool,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer,
                mode,
                config,
                outbound,
                socket,
                owns_socket,
                frames_tx,
                frames_rx: AsyncMutex::new(frames_rx),
                reports_tx,
                reports_rx: AsyncMutex::new(reports_rx),
                raw_tx,
                raw_rx: AsyncMutex::new(raw_rx),
                send_lock: AsyncMutex::new(()),
                closed,
                read_timeout: Mutex::new(None),
                receiver_task: Mutex::new(None),
                stats: StatsRecorder::new(),
            }),
        }
    }

    /// 임의의 송신 경로로 연결 생성
    ///
    /// 수신 데이터그램은 호출자가 [`Connection::deliver`]로 넣어야 한다.
    pub fn with_outbound(
        peer: SocketAddr,
        mode: Mode,
        config: Config,
        outbound: Arc<dyn Outbound>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(peer, mode, config, outbound, None, false))
    }

    /// 리스너 공유 소켓을 쓰는 서버측 연결
    pub(crate) fn for_listener(
        peer: SocketAddr,
        mode: Mode,
        config: Config,
        socket: Arc<UdpSocket>,
    ) -> Self {
        let outbound = Arc::new(UdpOutbound::new(socket.clone(), peer));
        Self::build(peer, mode, config, outbound, Some(socket), false)
    }

    /// 서버에 연결 (클라이언트)
    ///
    /// 임시 포트 소켓을 만들고, 피어에서 오는 데이터그램을 받는 태스크를 띄운다.
    pub async fn connect(host: &str, port: u16, mode: Mode, config: Config) -> Result<Self> {
        config.validate()?;

        let peer = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::AddrResolve(format!("{host}:{port}")))?;

        let socket = Arc::new(bind_socket(unspecified_for(&peer), &config)?);
        let outbound = Arc::new(UdpOutbound::new(socket.clone(), peer));
        let conn = Self::build(peer, mode, config, outbound, Some(socket.clone()), true);

        let task = spawn_receiver(Arc::downgrade(&conn.inner), socket.clone());
        *conn.inner.receiver_task.lock() = Some(task);

        info!(
            "연결 {} 생성: {} -> {} ({:?})",
            conn.inner.id,
            socket.local_addr()?,
            peer,
            mode
        );
        Ok(conn)
    }

    /// 수신 데이터그램 전달
    ///
    /// 연결이 닫혀 있으면 false (리스너는 이 주소를 레지스트리에서 제거한다)
    pub fn deliver(&self, datagram: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }

        let inner = &self.inner;
        match inner.mode {
            Mode::Raw => inner.raw_tx.send(datagram).is_ok(),
            Mode::Reliable => match Frame::decode(&datagram) {
                Ok(frame) if frame.kind == FrameType::Report => inner.reports_tx.send(frame).is_ok(),
                Ok(frame) => inner.frames_tx.send(frame).is_ok(),
                Err(e) => {
                    warn!("연결 {}: 프레임 디코드 실패, 버림: {}", inner.id, e);
                    true
                }
            },
        }
    }

    /// 메시지 전송
    ///
    /// reliable 모드에서는 수신자가 전부 받았다고 리포트할 때까지 대기한다.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.send_lock.lock().await;

        match self.inner.mode {
            Mode::Raw => self.send_raw(data).await,
            Mode::Reliable => self.send_reliable(data).await,
        }
    }

    /// 메시지 수신
    pub async fn recv(&self) -> Result<Bytes> {
        self.ensure_open()?;

        match self.inner.mode {
            Mode::Raw => self.recv_raw().await,
            Mode::Reliable => self.recv_reliable().await,
        }
    }

    /// 연결 종료 (되돌릴 수 없음)
    ///
    /// 대기 중인 send/recv는 `ConnectionClosed`로 깨어난다.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        if let Some(task) = self.inner.receiver_task.lock().take() {
            task.abort();
        }
        info!("연결 {} 종료: {}", self.inner.id, self.inner.peer);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.inner.peer.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.inner.peer.port()
    }

    /// "ip:port"
    pub fn remote_full_addr(&self) -> String {
        crate::transport::address_key(&self.inner.peer)
    }

    /// 로컬 소켓 주소 (서버 연결은 리스너 주소)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner.socket {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(Error::SharedSocket),
        }
    }

    /// 수신 루프 읽기 타임아웃 (다음 읽기부터 적용)
    ///
    /// 시간 내 데이터그램이 없으면 I/O 실패로 보고 연결을 닫는다.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.inner.owns_socket {
            return Err(Error::SharedSocket);
        }
        *self.inner.read_timeout.lock() = timeout;
        Ok(())
    }

    /// SO_BROADCAST
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        match &self.inner.socket {
            Some(socket) if self.inner.owns_socket => Ok(socket.set_broadcast(on)?),
            _ => Err(Error::SharedSocket),
        }
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.inner.stats.snapshot()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn transmit(&self, datagram: Bytes) -> Result<()> {
        self.inner.outbound.send(datagram).await?;
        StatsRecorder::add(&self.inner.stats.frames_sent, 1);
        Ok(())
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.inner.config.raw_chunk_size()) {
            self.transmit(Bytes::copy_from_slice(chunk)).await?;
        }

        let stats = &self.inner.stats;
        StatsRecorder::add(&stats.messages_sent, 1);
        StatsRecorder::add(&stats.bytes_sent, data.len() as u64);
        Ok(())
    }

    async fn recv_raw(&self) -> Result<Bytes> {
        let inner = &self.inner;
        let mut raw = inner.raw_rx.lock().await;

        let chunk = tokio::select! {
            biased;
            _ = inner.wait_closed() => return Err(Error::ConnectionClosed),
            chunk = raw.recv() => chunk.ok_or(Error::ConnectionClosed)?,
        };

        StatsRecorder::add(&inner.stats.messages_received, 1);
        StatsRecorder::add(&inner.stats.bytes_received, chunk.len() as u64);
        Ok(chunk)
    }

    async fn send_reliable(&self, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let config = &inner.config;

        let mut reports = inner.reports_rx.lock().await;
        // 이전 전송에 늦게 도착한 리포트
        while let Ok(stale) = reports.try_recv() {
            debug!("연결 {}: 지난 리포트 버림 (seq={})", inner.id, stale.seq);
        }

        let mut frames = split_message(data, config.chunk_size)?;
        let total = frames.len();
        let last_sent = Arc::new(Mutex::new(frames[total - 1].encode()));

        for frame in &frames {
            self.transmit(frame.encode()).await?;
        }

        debug!(
            "연결 {}: 메시지 전송 {} bytes, {} 프레임",
            inner.id,
            data.len(),
            total
        );

        // 마지막 프레임(END)이 유실되면 수신자는 전송 끝을 알 수 없으므로 재전송
        let expired = Arc::new(Notify::new());
        let timer = {
            let inner = inner.clone();
            let last_sent = last_sent.clone();
            let expired = expired.clone();
            DeadlineTimer::new(config.report_timeout, move || {
                let datagram = last_sent.lock().clone();
                let inner = inner.clone();
                tokio::spawn(async move {
                    match inner.outbound.send(datagram).await {
                        Ok(()) => {
                            StatsRecorder::add(&inner.stats.frames_sent, 1);
                            StatsRecorder::add(&inner.stats.timer_resends, 1);
                        }
                        Err(e) => warn!("마지막 프레임 재전송 실패: {}", e),
                    }
                });
                expired.notify_one();
            })
        };
        timer.start();

        let mut resends = 0u32;
        loop {
            let report = tokio::select! {
                report = reports.recv() => report,
                _ = expired.notified() => {
                    if timer.is_counting() {
                        continue;
                    }
                    resends += 1;
                    if config.max_report_retries.is_some_and(|limit| resends > limit) {
                        warn!("연결 {}: 리포트 없음, 전송 포기", inner.id);
                        return Err(Error::ReportTimeout { attempts: resends });
                    }
                    trace!("연결 {}: 리포트 대기 만료, 마지막 프레임 재전송 ({})", inner.id, resends);
                    timer.reset();
                    continue;
                }
                _ = inner.wait_closed() => return Err(Error::ConnectionClosed),
            };

            let Some(report) = report else {
                self.close();
                return Err(Error::Interrupted);
            };
            timer.stop();
            resends = 0;
            inner.stats.record_report();

            let missing = match parse_missing(&report.payload) {
                Ok(missing) => missing,
                Err(e) => {
                    warn!("연결 {}: {}", inner.id, e);
                    timer.reset();
                    continue;
                }
            };

            if missing.is_empty() {
                break;
            }

            let indices: Vec<usize> = missing
                .iter()
                .map(|&seq| seq as usize)
                .filter(|&idx| {
                    let valid = idx < total;
                    if !valid {
                        warn!("연결 {}: 범위 밖 누락 인덱스 {} 무시", inner.id, idx);
                    }
                    valid
                })
                .collect();

            if let Some(&last) = indices.last() {
                retag_for_repair(&mut frames, &indices);
                *last_sent.lock() = frames[last].encode();

                debug!(
                    "연결 {}: 리포트 수신, {}/{} 프레임 재전송",
                    inner.id,
                    indices.len(),
                    total
                );

                for &idx in &indices {
                    self.transmit(frames[idx].encode()).await?;
                }
                StatsRecorder::add(&inner.stats.frames_retransmitted, indices.len() as u64);
            }

            timer.reset();
        }

        timer.kill();
        StatsRecorder::add(&inner.stats.messages_sent, 1);
        StatsRecorder::add(&inner.stats.bytes_sent, data.len() as u64);
        Ok(())
    }

    async fn recv_reliable(&self) -> Result<Bytes> {
        let inner = &self.inner;
        let config = &inner.config;
        let mut frames = inner.frames_rx.lock().await;

        let expired = Arc::new(Notify::new());
        let timer = {
            let expired = expired.clone();
            DeadlineTimer::new(config.recv_timeout, move || expired.notify_one())
        };
        timer.start();

        let mut buffer = ReassemblyBuffer::new(config.max_message_frames);
        loop {
            // END 프레임이 배치될 때까지 도착 순서대로 배치
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = inner.wait_closed() => return Err(Error::ConnectionClosed),
                    frame = frames.recv() => frame.ok_or(Error::ConnectionClosed)?,
                    _ = expired.notified() => {
                        if timer.is_counting() {
                            continue;
                        }
                        warn!("연결 {}: 수신 타임아웃 ({} 슬롯)", inner.id, buffer.len());
                        return Err(Error::Timeout {
                            waited_ms: config.recv_timeout.as_millis() as u64,
                        });
                    }
                };

                let is_end = frame.is_end();
                let seq = frame.seq;
                if !buffer.place(frame) {
                    warn!("연결 {}: seq {} 상한 초과, 버림", inner.id, seq);
                    continue;
                }
                timer.reset();

                if is_end {
                    break;
                }
            }

            let slot_count = buffer.len() as u32;
            if buffer.is_complete() {
                timer.stop();
                self.send_report(slot_count, &[]).await?;
                break;
            }

            let missing = buffer.missing(config.max_reported_gaps);
            debug!(
                "연결 {}: 누락 {}/{} 프레임 요청",
                inner.id,
                missing.len(),
                slot_count
            );
            self.send_report(slot_count, &missing).await?;
        }

        timer.kill();
        let data = buffer.take_message();
        StatsRecorder::add(&inner.stats.messages_received, 1);
        StatsRecorder::add(&inner.stats.bytes_received, data.len() as u64);
        Ok(data)
    }

    async fn send_report(&self, slot_count: u32, missing: &[u32]) -> Result<()> {
        let report = Frame::report(slot_count, missing);
        self.inner.outbound.send(report.encode()).await?;
        StatsRecorder::add(&self.inner.stats.reports_sent, 1);
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("mode", &self.inner.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 재전송할 프레임들의 타입 재지정
///
/// 첫 프레임은 Start, 마지막은 End (하나뿐이면 End), 나머지는 Data.
/// 수신자는 End 프레임을 보고 이번 라운드가 끝났음을 안다.
fn retag_for_repair(frames: &mut [Frame], indices: &[usize]) {
    let last = indices.len() - 1;
    for (pos, &idx) in indices.iter().enumerate() {
        frames[idx].kind = if pos == last {
            FrameType::End
        } else if pos == 0 {
            FrameType::Start
        } else {
            FrameType::Data
        };
    }
}

/// 클라이언트 소켓 수신 루프
///
/// 연결 핸들이 모두 사라지면 스스로 종료한다.
fn spawn_receiver(inner: Weak<Inner>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (peer, max_datagram) = match inner.upgrade() {
            Some(inner) => (inner.peer, inner.config.max_datagram_size),
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
            let conn = Connection { inner };

            match result {
                Ok((len, from)) => {
                    if from != peer {
                        trace!("연결 {}: 다른 주소 {} 데이터그램 무시", conn.id(), from);
                        continue;
                    }
                    if !conn.deliver(Bytes::copy_from_slice(&buf[..len])) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("연결 {}: 수신 에러, 연결 종료: {}", conn.id(), e);
                    conn.close();
                    break;
                }
            }
        }
    })
}
