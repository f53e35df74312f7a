//! 프로토콜 설정

use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_CHUNK_SIZE, HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_REPORTED_GAPS,
};

/// accept() 가 대기 중인 연결을 꺼내는 순서
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOrder {
    /// 가장 최근에 등록된 피어부터
    Lifo,
    /// 먼저 등록된 피어부터
    Fifo,
}

/// 연결/리스너 공통 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 프레임당 페이로드 크기 (바이트)
    /// 1472 - 5: PPPoE 없는 일반 링크에서 IP 단편화를 피하는 크기
    pub chunk_size: usize,

    /// 송신 후 리포트 프레임 대기 시간
    /// 만료되면 마지막 프레임을 재전송
    pub report_timeout: Duration,

    /// 리포트 없이 연속 만료 허용 횟수
    /// None이면 리포트가 오거나 연결이 닫힐 때까지 계속 재전송
    pub max_report_retries: Option<u32>,

    /// 수신 진행이 없을 때 타임아웃
    pub recv_timeout: Duration,

    /// 한 번의 리포트에 담는 누락 인덱스 최대 개수
    pub max_reported_gaps: usize,

    /// 한 메시지의 최대 프레임 수 (조립 버퍼 상한)
    pub max_message_frames: u32,

    /// 최대 UDP 데이터그램 크기
    pub max_datagram_size: usize,

    /// 소켓 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// SO_BROADCAST
    pub broadcast: bool,

    /// accept() 순서
    pub accept_order: AcceptOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            report_timeout: Duration::from_millis(1000),
            max_report_retries: None,
            recv_timeout: Duration::from_millis(1000),
            max_reported_gaps: MAX_REPORTED_GAPS,
            max_message_frames: 1 << 20,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            recv_buffer_size: 64 * 1024,    // 64KB
            broadcast: false,
            accept_order: AcceptOrder::Lifo,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 헤더 포함 프레임 최대 크기
    pub fn frame_size(&self) -> usize {
        self.chunk_size + HEADER_LEN
    }

    /// raw 모드 청크 크기 (헤더가 없으므로 프레임 크기 전체 사용)
    pub fn raw_chunk_size(&self) -> usize {
        self.frame_size()
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0보다 커야 함".into()));
        }
        if self.frame_size() > self.max_datagram_size {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} + 헤더 {}가 최대 데이터그램 {} 초과",
                self.chunk_size, HEADER_LEN, self.max_datagram_size
            )));
        }
        if self.report_timeout.is_zero() || self.recv_timeout.is_zero() {
            return Err(Error::InvalidConfig("타임아웃은 0보다 커야 함".into()));
        }
        if self.max_reported_gaps == 0 {
            return Err(Error::InvalidConfig("max_reported_gaps는 0보다 커야 함".into()));
        }
        if self.max_message_frames == 0 {
            return Err(Error::InvalidConfig("max_message_frames는 0보다 커야 함".into()));
        }
        Ok(())
    }

    /// 손실이 많은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            chunk_size: 1200,                  // 작은 청크
            report_timeout: Duration::from_millis(2000),
            recv_timeout: Duration::from_millis(3000),
            recv_buffer_size: 1024 * 1024,     // 1MB
            ..Self::default()
        }
    }

    /// 저지연 LAN용 설정
    pub fn low_latency() -> Self {
        Self {
            report_timeout: Duration::from_millis(200),
            recv_timeout: Duration::from_millis(500),
            recv_buffer_size: 2 * 1024 * 1024, // 2MB
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_fits_mtu() {
        let config = Config::default();
        assert_eq!(config.frame_size(), 1472);
        assert!(config.validate().is_ok());
        // 기본값은 리포트가 올 때까지 무제한 대기
        assert!(config.max_report_retries.is_none());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(Config::lossy_network().validate().is_ok());
        assert!(Config::low_latency().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_chunk() {
        let config = Config {
            chunk_size: MAX_DATAGRAM_SIZE,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
