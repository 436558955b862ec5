//! RUDP 서버 (파일 수신자)
//!
//! 신규 세션을 계속 수락하고 세션마다 수신 스레드를 하나씩 띄운다.
//! 받은 파일은 출력 디렉토리에 `_received_<name>` 으로 저장된다.
//!
//! 사용법:
//!   cargo run --release --bin rudp-server -- <PORT> [OPTIONS]
//!
//! 예시:
//!   # 70% 손실 환경에서 수신
//!   cargo run --release --bin rudp-server -- 9000 --reliability 0.3 --out received/

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rudp::{Config, Dispatcher, FileReceiver, UdpChannel};

/// 서버 설정
struct ServerConfig {
    port: u16,
    out_dir: PathBuf,
    config: Config,
}

fn usage() -> &'static str {
    r#"RUDP Server - stop-and-wait 신뢰성 세션 파일 수신 서버

사용법:
  cargo run --release --bin rudp-server -- <PORT> [OPTIONS]

옵션:
  -r, --reliability <R>   송신이 실제로 나갈 확률 0.0~1.0 (기본: 0.3)
  -o, --out <DIR>         수신 파일 저장 디렉토리 (기본: .)
  -h, --help              이 도움말 출력

예시:
  cargo run --release --bin rudp-server -- 9000
  cargo run --release --bin rudp-server -- 9000 -r 1.0 -o received/
"#
}

fn parse_args() -> Result<ServerConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut port = None;
    let mut out_dir = PathBuf::from(".");
    let mut config = Config::unstable_network();

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
            "--out" | "-o" => {
                let value = args.get(i + 1).ok_or("--out 값 필요")?;
                out_dir = PathBuf::from(value);
                i += 1;
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other if port.is_none() => {
                port = Some(
                    other
                        .parse::<u16>()
                        .map_err(|_| format!("유효한 포트 필요: {other}"))?,
                );
            }
            other => return Err(format!("알 수 없는 인자: {other}")),
        }
        i += 1;
    }

    Ok(ServerConfig {
        port: port.ok_or("포트 필요")?,
        out_dir,
        config,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 로 조정)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}\n\n{}", usage());
            std::process::exit(2);
        }
    };

    std::fs::create_dir_all(&server_config.out_dir)?;

    info!("RUDP Server starting...");
    info!("Reliability: {:.1}%", server_config.config.reliability * 100.0);
    info!(
        "Retransmit interval: {} ms",
        server_config.config.retransmit_interval_ms
    );
    info!("Output directory: {:?}", server_config.out_dir);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    let channel = UdpChannel::bind(bind_addr, &server_config.config)?;
    let dispatcher = Dispatcher::new(channel.clone(), server_config.config.clone());
    dispatcher.start();

    info!("Server listening on {}", channel.local_addr());

    loop {
        let params = dispatcher.accept()?;
        info!(
            "Connection from {}:{} (remote id {})",
            params.remote_host, params.remote_port, params.remote_id
        );

        let receiver = match FileReceiver::accept(&dispatcher, &params, &server_config.out_dir) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("세션 수락 실패: {}", e);
                continue;
            }
        };

        // 세션마다 완료를 기다리는 스레드 (수신자 참조를 유지)
        thread::Builder::new()
            .name(format!("rudp-receiver-{}", params.local_id))
            .spawn(move || match receiver.wait_completed() {
                Ok(path) => info!("File saved: {}", path.display()),
                Err(e) => warn!("파일 수신 실패: {}", e),
            })?;

        info!("{}", dispatcher.stats().summary());
    }
}
