//! 에러 타입 정의

use thiserror::Error;

/// nackudp 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("프레임이 너무 짧음: 최소 {expected} 바이트, 실제 {got} 바이트")]
    FrameTooShort { expected: usize, got: usize },

    #[error("유효하지 않은 리포트 페이로드: {0}")]
    InvalidReport(String),

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("리스너 종료")]
    ListenerClosed,

    #[error("수신 타임아웃: {waited_ms}ms 동안 진행 없음")]
    Timeout { waited_ms: u64 },

    #[error("리포트 대기 타임아웃: 마지막 프레임 {attempts}회 재전송 후 응답 없음")]
    ReportTimeout { attempts: u32 },

    #[error("리포트 대기 중단")]
    Interrupted,

    #[error("공유 소켓 연결에서는 소켓 옵션을 변경할 수 없음 (리스너에서 설정)")]
    SharedSocket,

    #[error("주소 해석 실패: {0}")]
    AddrResolve(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
