//! 패킷 정의
//!
//! 와이어 포맷: `<session_id>;<seq>;<body>` (데이터그램 하나에 패킷 하나)
//! body 는 제어 토큰 `HELLO`, `ACK` 또는 애플리케이션 문자열

use std::fmt;

use crate::{Error, Result, Seq, SessionId, ACK_TOKEN, FIELD_SEPARATOR, HELLO_TOKEN};

/// 디코딩된 패킷
///
/// 파싱 경계에서 한 번만 분류하고 이후에는 match 로 처리
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// 세션 개시 (핸드셰이크)
    Hello { session_id: SessionId, seq: Seq },

    /// (session_id, seq) 패킷 수신 확인
    Ack { session_id: SessionId, seq: Seq },

    /// 애플리케이션 메시지
    Data {
        session_id: SessionId,
        seq: Seq,
        body: String,
    },
}

impl Packet {
    pub fn hello(session_id: SessionId, seq: Seq) -> Self {
        Packet::Hello { session_id, seq }
    }

    pub fn ack(session_id: SessionId, seq: Seq) -> Self {
        Packet::Ack { session_id, seq }
    }

    pub fn data(session_id: SessionId, seq: Seq, body: impl Into<String>) -> Self {
        Packet::Data {
            session_id,
            seq,
            body: body.into(),
        }
    }

    /// 패킷이 속한 세션 ID
    pub fn session_id(&self) -> SessionId {
        match self {
            Packet::Hello { session_id, .. }
            | Packet::Ack { session_id, .. }
            | Packet::Data { session_id, .. } => *session_id,
        }
    }

    pub fn seq(&self) -> Seq {
        match self {
            Packet::Hello { seq, .. } | Packet::Ack { seq, .. } | Packet::Data { seq, .. } => *seq,
        }
    }

    pub fn is_hello(&self) -> bool {
        matches!(self, Packet::Hello { .. })
    }

    /// 와이어 문자열로 인코딩
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// 와이어 문자열에서 디코딩
    ///
    /// 필드는 앞에서부터 두 번만 나누므로 body 에 `;` 가 있어도 된다.
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = text.splitn(3, FIELD_SEPARATOR);
        let (id_field, seq_field, body) = match (fields.next(), fields.next(), fields.next()) {
            (Some(id), Some(seq), Some(body)) => (id, seq, body),
            _ => {
                return Err(Error::MalformedPacket {
                    reason: format!("필드 수 부족: {text:?}"),
                })
            }
        };

        let session_id: SessionId = id_field.trim().parse().map_err(|_| Error::MalformedPacket {
            reason: format!("session_id 가 숫자가 아님: {id_field:?}"),
        })?;
        let seq: Seq = seq_field.trim().parse().map_err(|_| Error::MalformedPacket {
            reason: format!("seq 가 숫자가 아님: {seq_field:?}"),
        })?;

        Ok(match body {
            HELLO_TOKEN => Packet::Hello { session_id, seq },
            ACK_TOKEN => Packet::Ack { session_id, seq },
            _ => Packet::Data {
                session_id,
                seq,
                body: body.to_string(),
            },
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = FIELD_SEPARATOR;
        match self {
            Packet::Hello { session_id, seq } => write!(f, "{session_id}{sep}{seq}{sep}{HELLO_TOKEN}"),
            Packet::Ack { session_id, seq } => write!(f, "{session_id}{sep}{seq}{sep}{ACK_TOKEN}"),
            Packet::Data {
                session_id,
                seq,
                body,
            } => write!(f, "{session_id}{sep}{seq}{sep}{body}"),
        }
    }
}

/// 애플리케이션 페이로드가 제어 토큰과 겹치는지 확인
pub fn is_reserved(payload: &str) -> bool {
    payload == HELLO_TOKEN || payload == ACK_TOKEN
}
