//! # nackudp
//!
//! UDP 기반 NACK 신뢰성 전송 + 주소별 연결 다중화
//!
//! ## 핵심 특징
//! - **NACK 기반**: ACK 없이 누락 프레임만 리포트로 요청
//! - **한 번에 전송**: 메시지 전체를 프레임으로 나눠 바로 보내고, 수신자가 순서 복원
//! - **Raw 모드**: 헤더/복구 없이 데이터그램 그대로 통과
//! - **다중화**: 소켓 하나로 여러 피어를 받아 피어별 연결 제공
//!
//! ## 프레임 형식
//! ```text
//! +--------+----------------+-----------------+
//! | type 1 | seq 4 (BE u32) | payload         |
//! +--------+----------------+-----------------+
//! ```
//! type: 0 = DATA, 1 = START, 2 = END, 3 = REPORT
//!
//! ## 알려진 제약
//! 프레임에 메시지 id가 없다. 이전 메시지의 지연된 END 프레임이나
//! 유실된 리포트가 다음 메시지 조립에 섞일 수 있다.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod listener;
pub mod reassembly;
pub mod simulator;
pub mod stats;
pub mod timer;
pub mod transport;

pub use config::{AcceptOrder, Config};
pub use connection::{Connection, Mode};
pub use error::{Error, Result};
pub use frame::{Frame, FrameType};
pub use listener::Listener;
pub use stats::TransferStats;
pub use timer::DeadlineTimer;
pub use transport::{Outbound, UdpOutbound};

/// 프레임 헤더 크기 (type 1 + seq 4)
pub const HEADER_LEN: usize = 5;

/// 기본 프레임 페이로드 크기 (1472 - 헤더)
pub const DEFAULT_CHUNK_SIZE: usize = 1467;

/// IPv4 UDP 최대 페이로드
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// 리포트 한 번에 담는 누락 인덱스 최대 개수
pub const MAX_REPORTED_GAPS: usize = 10_000;
