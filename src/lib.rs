//! # RUDP (Reliable UDP sessions)
//!
//! UDP 소켓 하나 위에서 여러 개의 신뢰성 있는 메시지 세션을 다중화하는 전송 계층
//!
//! ## 핵심 특징
//! - **stop-and-wait**: 세션당 확인 대기 메시지는 최대 하나, ACK 가 올 때까지 주기적 재전송
//! - **순서 보장**: 순서대로 도착한 메시지만 한 번씩 상위로 전달
//! - **세션 다중화**: 디스패처가 세션 ID 로 패킷을 나누고 신규 연결을 수락 큐에 올림
//! - **손실 시뮬레이션**: 채널 신뢰도 설정으로 송신을 임의로 버림
//!
//! ## 계층
//!
//! ```text
//! FileSender / FileReceiver   (transfer)
//!            │
//!         Session             (session)
//!            │
//!        Dispatcher           (dispatcher)
//!            │
//!        UdpChannel           (channel)
//! ```
//!
//! 와이어 포맷은 `<session_id>;<seq>;<body>` 텍스트 ([`packet`] 참고)

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod session;
pub mod stats;
pub mod transfer;

pub use channel::{DatagramSink, Link, UdpChannel};
pub use config::Config;
pub use dispatcher::{ConnectionParameters, Dispatcher, PendingPacket};
pub use error::{Error, Result};
pub use packet::Packet;
pub use session::{MessageHandler, Session};
pub use stats::{DispatchStatsSnapshot, SessionStatsSnapshot};
pub use transfer::{FileReceiver, FileSender};

/// 세션 식별자 (부호 있는 32비트)
pub type SessionId = i32;

/// 세션 내 메시지 순번 (부호 있는 32비트, 넘치면 wrap)
pub type Seq = i32;

/// 핸드셰이크 제어 토큰
pub const HELLO_TOKEN: &str = "HELLO";

/// 수신 확인 제어 토큰
pub const ACK_TOKEN: &str = "ACK";

/// 와이어 필드 구분자
pub const FIELD_SEPARATOR: char = ';';

/// 기본 수락 큐 크기
pub const DEFAULT_ADMISSION_CAPACITY: usize = 512;

/// UDP 데이터그램 하나에 실을 수 있는 최대 페이로드 (IPv4, 바이트)
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// 기본 수신 버퍼 크기 (바이트)
pub const DEFAULT_RECV_BUFFER_SIZE: usize = MAX_DATAGRAM_SIZE;

/// 파일 전송 종료 표식
pub const CLOSE_MESSAGE: &str = "**CLOSE**";

/// 파일 전송 헤더 접두어 (`SEND <name>`)
pub const SEND_PREFIX: &str = "SEND ";
