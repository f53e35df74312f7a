//! nackudp 서버 - 다중화 리스너 수동 테스트용
//!
//! 피어마다 연결을 수락해서 받은 메시지를 그대로 돌려주거나(echo),
//! 받기만 하고 크기/소요 시간을 출력한다(sink).
//!
//! 사용법:
//!   cargo run --release --bin nackudp-server -- [OPTIONS]
//!
//! 예시:
//!   # 에코 서버
//!   cargo run --release --bin nackudp-server -- --bind 0.0.0.0:1234
//!
//!   # 수신 성능 측정
//!   cargo run --release --bin nackudp-server -- --sink

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nackudp::{AcceptOrder, Config, Connection, Error, Listener, Mode};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    mode: Mode,
    sink: bool,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1234)),
            mode: Mode::Reliable,
            sink: false,
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, Box<dyn StdError>> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag}: 값 필요").into())
}

fn parse_args() -> Result<ServerConfig, Box<dyn StdError>> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                config.bind_addr = value(&args, i, "--bind")?.parse()?;
                i += 1;
            }
            "--raw" => config.mode = Mode::Raw,
            "--sink" => config.sink = true,
            "--fifo" => config.config.accept_order = AcceptOrder::Fifo,
            "--lossy" => {
                config.config = Config {
                    accept_order: config.config.accept_order,
                    ..Config::lossy_network()
                }
            }
            "--chunk-size" => {
                config.config.chunk_size = value(&args, i, "--chunk-size")?.parse()?;
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"nackudp Server - NACK 기반 신뢰성 UDP 다중화 서버

사용법:
  cargo run --release --bin nackudp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:1234)
  --raw                   raw 모드 (복구 없음)
  --sink                  에코 대신 수신만 하고 통계 출력
  --fifo                  먼저 온 피어부터 수락 (기본: 최근 피어부터)
  --lossy                 손실 많은 네트워크용 설정
  --chunk-size <SIZE>     프레임 페이로드 크기 (기본: 1467)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(config)
}

async fn serve(conn: Connection, sink: bool) {
    let peer = conn.remote_full_addr();
    let started = Instant::now();
    let mut total = 0usize;

    loop {
        let message = match conn.recv().await {
            Ok(message) => message,
            Err(Error::Timeout { .. }) => continue,
            Err(e) => {
                info!("[{}] 수신 종료: {}", peer, e);
                break;
            }
        };
        total += message.len();

        if sink {
            info!(
                "[{}] {} bytes 수신 ({:.1}ms)",
                peer,
                message.len(),
                started.elapsed().as_secs_f64() * 1000.0
            );
            continue;
        }

        info!("[{}] 에코 {} bytes", peer, message.len());
        if let Err(e) = conn.send(&message).await {
            warn!("[{}] 에코 실패: {}", peer, e);
            break;
        }
    }

    let stats = conn.stats();
    info!(
        "[{}] 연결 종료: 총 {} bytes, 리포트 {}회, 재전송률 {:.2}%",
        peer,
        total,
        stats.reports_sent,
        stats.retransmit_ratio() * 100.0
    );
    conn.close();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server_config = parse_args()?;

    info!("nackudp Server starting...");
    info!("Mode: {:?}", server_config.mode);
    info!("Chunk size: {} bytes", server_config.config.chunk_size);

    let listener = Listener::listen(
        server_config.bind_addr,
        server_config.mode,
        server_config.config.clone(),
    )
    .await?;
    info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let conn = accepted?;
                tokio::spawn(serve(conn, server_config.sink));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("종료 신호 수신");
                break;
            }
        }
    }

    listener.close();
    Ok(())
}
