//! nackudp 클라이언트 - 수동 테스트용
//!
//! 서버에 연결해 파일(또는 더미 데이터)을 한 번에 보내고 소요 시간을 출력한다.
//! echo 서버와 쓰면 돌아온 데이터를 비교한다.
//!
//! 사용법:
//!   cargo run --release --bin nackudp-client -- [OPTIONS]
//!
//! 예시:
//!   # 파일 전송 후 에코 검증
//!   cargo run --release --bin nackudp-client -- --server 127.0.0.1 --port 1234 --file test.mp3
//!
//!   # raw 모드로 4MB 전송, 응답 대기 없음
//!   cargo run --release --bin nackudp-client -- --raw --size 4194304 --no-echo

use std::error::Error as StdError;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nackudp::{Config, Connection, Mode};

/// 클라이언트 설정
struct ClientConfig {
    host: String,
    port: u16,
    mode: Mode,
    file_path: Option<PathBuf>,
    size: usize,
    repeat: usize,
    expect_echo: bool,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
            mode: Mode::Reliable,
            file_path: None,
            size: 1024 * 1024,
            repeat: 1,
            expect_echo: true,
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, Box<dyn StdError>> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag}: 값 필요").into())
}

fn parse_args() -> Result<ClientConfig, Box<dyn StdError>> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                config.host = value(&args, i, "--server")?.to_string();
                i += 1;
            }
            "--port" | "-p" => {
                config.port = value(&args, i, "--port")?.parse()?;
                i += 1;
            }
            "--file" | "-f" => {
                config.file_path = Some(PathBuf::from(value(&args, i, "--file")?));
                i += 1;
            }
            "--size" => {
                config.size = value(&args, i, "--size")?.parse()?;
                i += 1;
            }
            "--repeat" | "-n" => {
                config.repeat = value(&args, i, "--repeat")?.parse()?;
                i += 1;
            }
            "--raw" => config.mode = Mode::Raw,
            "--no-echo" => config.expect_echo = false,
            "--lossy" => config.config = Config::lossy_network(),
            "--help" | "-h" => {
                println!(
                    r#"nackudp Client - NACK 기반 신뢰성 UDP 클라이언트

사용법:
  cargo run --release --bin nackudp-client -- [OPTIONS]

옵션:
  -s, --server <HOST>    서버 호스트 (기본: 127.0.0.1)
  -p, --port <PORT>      서버 포트 (기본: 1234)
  -f, --file <PATH>      전송할 파일 (없으면 더미 데이터)
  --size <BYTES>         더미 데이터 크기 (기본: 1MB)
  -n, --repeat <N>       전송 반복 횟수 (기본: 1)
  --raw                  raw 모드 (복구 없음)
  --no-echo              에코 응답을 기다리지 않음
  --lossy                손실 많은 네트워크용 설정
  -h, --help             이 도움말 출력

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

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client_config = parse_args()?;

    let payload = match &client_config.file_path {
        Some(path) => {
            info!("Loading file: {:?}", path);
            std::fs::read(path)?
        }
        None => {
            info!("Using test data ({} bytes)", client_config.size);
            (0..client_config.size).map(|i| (i % 251) as u8).collect()
        }
    };

    let conn = Connection::connect(
        &client_config.host,
        client_config.port,
        client_config.mode,
        client_config.config.clone(),
    )
    .await?;
    info!(
        "Connected: {} -> {}",
        conn.local_addr()?,
        conn.remote_full_addr()
    );

    for round in 1..=client_config.repeat {
        let start = Instant::now();
        conn.send(&payload).await?;
        let sent = start.elapsed();
        info!(
            "#{} 전송 {} bytes: {:.2}ms ({:.2} MB/s)",
            round,
            payload.len(),
            sent.as_secs_f64() * 1000.0,
            payload.len() as f64 / sent.as_secs_f64().max(f64::EPSILON) / 1_000_000.0
        );

        if client_config.expect_echo && client_config.mode == Mode::Reliable {
            let echoed = conn.recv().await?;
            if echoed.as_ref() == payload.as_slice() {
                info!("#{} 에코 일치 ({:.2}ms 왕복)", round, start.elapsed().as_secs_f64() * 1000.0);
            } else {
                warn!("#{} 에코 불일치: {} / {} bytes", round, echoed.len(), payload.len());
            }
        }
    }

    let stats = conn.stats();
    info!("Transfer complete!");
    info!("  Frames sent: {}", stats.frames_sent);
    info!("  Frames retransmitted: {}", stats.frames_retransmitted);
    info!("  Timer resends: {}", stats.timer_resends);
    info!("  Reports received: {}", stats.reports_received);

    conn.close();
    Ok(())
}
