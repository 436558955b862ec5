//! RUDP 클라이언트 (파일 송신자)
//!
//! 로컬 포트에 채널을 열고 세션 하나로 파일 하나를 줄 단위로 보낸다.
//!
//! 사용법:
//!   cargo run --release --bin rudp-client -- <PORT> <HOST> <PEER_PORT> <FILE> [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin rudp-client -- 9001 127.0.0.1 9000 notes.txt

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rudp::{Config, Dispatcher, FileSender, UdpChannel};

/// 클라이언트 설정
struct ClientConfig {
    port: u16,
    host: String,
    peer_port: u16,
    file: PathBuf,
    config: Config,
}

fn usage() -> &'static str {
    r#"RUDP Client - stop-and-wait 신뢰성 세션 파일 송신 클라이언트

사용법:
  cargo run --release --bin rudp-client -- <PORT> <HOST> <PEER_PORT> <FILE> [OPTIONS]

인자:
  <PORT>                  로컬 포트 (0 = 자동 할당)
  <HOST> <PEER_PORT>      서버 주소
  <FILE>                  전송할 텍스트 파일

옵션:
  -r, --reliability <R>   송신이 실제로 나갈 확률 0.0~1.0 (기본: 1.0)
  -h, --help              이 도움말 출력

예시:
  # 50% 손실 환경에서 전송
  cargo run --release --bin rudp-client -- 0 127.0.0.1 9000 notes.txt -r 0.5
"#
}

fn parse_args() -> Result<ClientConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut positional: Vec<String> = Vec::new();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--reliability" | "-r" => {
                let value = args.get(i + 1).ok_or("--reliability 값 필요")?;
                config.reliability = value
                    .parse()
                    .map_err(|_| format!("유효한 숫자 필요: {value}"))?;
                i += 1;
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let [port, host, peer_port, file] = <[String; 4]>::try_from(positional)
        .map_err(|given| format!("인자 4개 필요 (받은 수: {})", given.len()))?;

    Ok(ClientConfig {
        port: port
            .parse()
            .map_err(|_| format!("유효한 포트 필요: {port}"))?,
        host,
        peer_port: peer_port
            .parse()
            .map_err(|_| format!("유효한 포트 필요: {peer_port}"))?,
        file: PathBuf::from(file),
        config,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 로 조정)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}\n\n{}", usage());
            std::process::exit(2);
        }
    };

    info!("RUDP Client starting...");
    info!(
        "Server: {}:{}",
        client_config.host, client_config.peer_port
    );
    info!("File: {:?}", client_config.file);
    info!("Reliability: {:.1}%", client_config.config.reliability * 100.0);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], client_config.port));
    let channel = UdpChannel::bind(bind_addr, &client_config.config)?;
    let dispatcher = Dispatcher::new(channel.clone(), client_config.config.clone());
    dispatcher.start();

    info!("Client bound on {}", channel.local_addr());

    let start = Instant::now();
    let stats = FileSender::send_file(
        &dispatcher,
        &client_config.host,
        client_config.peer_port,
        &client_config.file,
    )?;

    info!("Transfer complete!");
    info!("  Time: {:.2}s", start.elapsed().as_secs_f64());
    info!("  {}", stats.summary());

    info!("closing");
    channel.close();
    Ok(())
}
