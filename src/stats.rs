//! 연결별 전송 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

/// 전송 통계 스냅샷
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 연결 생성 시간
    pub start_time: Instant,

    /// 송신 완료 메시지 수
    pub messages_sent: u64,

    /// 수신 완료 메시지 수
    pub messages_received: u64,

    /// 송신 프레임 수 (리포트 재전송과 타이머 재전송 포함, raw 모드는 청크 수)
    pub frames_sent: u64,

    /// 리포트 요청으로 재전송한 프레임 수
    pub frames_retransmitted: u64,

    /// 타이머 만료로 마지막 프레임을 다시 보낸 횟수
    pub timer_resends: u64,

    /// 보낸 리포트 수
    pub reports_sent: u64,

    /// 받은 리포트 수
    pub reports_received: u64,

    /// 송신 페이로드 바이트
    pub bytes_sent: u64,

    /// 수신 페이로드 바이트
    pub bytes_received: u64,

    /// 마지막 리포트 수신 시간
    pub last_report_time: Option<Instant>,
}

impl TransferStats {
    /// 재전송 비율 (재전송 프레임 / 전체 송신 프레임)
    pub fn retransmit_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            return 0.0;
        }
        (self.frames_retransmitted + self.timer_resends) as f64 / self.frames_sent as f64
    }
}

/// 통계 카운터 (송수신 태스크에서 동시에 갱신)
#[derive(Debug)]
pub(crate) struct StatsRecorder {
    start_time: Instant,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_retransmitted: AtomicU64,
    pub timer_resends: AtomicU64,
    pub reports_sent: AtomicU64,
    pub reports_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    last_report_time: RwLock<Option<Instant>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_retransmitted: AtomicU64::new(0),
            timer_resends: AtomicU64::new(0),
            reports_sent: AtomicU64::new(0),
            reports_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_report_time: RwLock::new(None),
        }
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_report(&self) {
        Self::add(&self.reports_received, 1);
        *self.last_report_time.write() = Some(Instant::now());
    }

    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            start_time: self.start_time,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_retransmitted: self.frames_retransmitted.load(Ordering::Relaxed),
            timer_resends: self.timer_resends.load(Ordering::Relaxed),
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            reports_received: self.reports_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            last_report_time: *self.last_report_time.read(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_ratio() {
        let recorder = StatsRecorder::new();
        assert_eq!(recorder.snapshot().retransmit_ratio(), 0.0);

        StatsRecorder::add(&recorder.frames_sent, 10);
        StatsRecorder::add(&recorder.frames_retransmitted, 2);
        StatsRecorder::add(&recorder.timer_resends, 1);
        recorder.record_report();

        let stats = recorder.snapshot();
        assert!((stats.retransmit_ratio() - 0.3).abs() < f64::EPSILON);
        assert_eq!(stats.reports_received, 1);
        assert!(stats.last_report_time.is_some());
    }
}
