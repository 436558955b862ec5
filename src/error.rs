//! 에러 타입 정의

use thiserror::Error;

use crate::{Seq, SessionId};

/// RUDP 프로토콜 에러 타입
///
/// 전송 손실, 잘못된 패킷, 수락 큐 포화, 알 수 없는 세션 패킷은
/// 호출자에게 에러로 올라가지 않는다. 로그와 통계로만 남는다.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("주소 해석 실패: {host}:{port}")]
    AddressResolution { host: String, port: u16 },

    #[error("잘못된 패킷: {reason}")]
    MalformedPacket { reason: String },

    #[error("예약된 제어 토큰은 페이로드로 보낼 수 없음: {payload:?}")]
    ReservedPayload { payload: String },

    #[error("패킷이 데이터그램 한도를 넘음: {size} > {max} 바이트")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("이미 사용 중인 세션 ID: {session_id}")]
    SessionIdInUse { session_id: SessionId },

    #[error("재전송 한도 초과: session_id={session_id}, seq={seq}, attempts={attempts}")]
    RetriesExhausted {
        session_id: SessionId,
        seq: Seq,
        attempts: u32,
    },

    #[error("세션 종료됨: session_id={session_id}")]
    SessionClosed { session_id: SessionId },

    #[error("채널 에러")]
    ChannelError,

    #[error("유효하지 않은 신뢰도: {value} (0.0 ~ 1.0)")]
    InvalidReliability { value: f64 },

    #[error("파일 전송 에러: {0}")]
    Transfer(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
