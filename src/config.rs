//! 프로토콜 설정

use std::time::Duration;

use crate::{DEFAULT_ADMISSION_CAPACITY, DEFAULT_RECV_BUFFER_SIZE, MAX_DATAGRAM_SIZE};

/// RUDP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// stop-and-wait 재전송 주기 (밀리초)
    pub retransmit_interval_ms: u64,

    /// 메시지당 최대 재전송 횟수
    /// None 이면 ACK 가 올 때까지 무한히 재전송
    pub max_retransmits: Option<u32>,

    /// 신규 연결 수락 큐 크기
    pub admission_capacity: usize,

    /// 종료 요청 후 세션 정리까지의 유예 시간 (밀리초)
    pub session_clear_delay_ms: u64,

    /// 데이터그램 수신 버퍼 크기
    /// 이보다 큰 데이터그램은 수신측에서 버려지고, 송신측은 보내지 않는다
    pub recv_buffer_size: usize,

    /// 송신이 실제로 나갈 확률 (0.0 ~ 1.0)
    /// 1.0 = 손실 없음
    pub reliability: f64,

    /// 수신 스레드의 소켓 읽기 타임아웃 (밀리초)
    /// close() 를 감지하는 주기
    pub recv_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retransmit_interval_ms: 100,
            max_retransmits: None,
            admission_capacity: DEFAULT_ADMISSION_CAPACITY,
            session_clear_delay_ms: 5000,     // 5초
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            reliability: 1.0,
            recv_poll_interval_ms: 100,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }

    pub fn session_clear_delay(&self) -> Duration {
        Duration::from_millis(self.session_clear_delay_ms)
    }

    /// 인코딩된 패킷 하나의 최대 크기
    pub fn max_datagram_size(&self) -> usize {
        self.recv_buffer_size.min(MAX_DATAGRAM_SIZE)
    }

    pub fn recv_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recv_poll_interval_ms.max(1))
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            retransmit_interval_ms: 10,       // 10ms 마다 재전송
            reliability: 0.3,                 // 70% 손실 시뮬레이션
            ..Self::default()
        }
    }

    /// 로컬 테스트용 설정 (짧은 주기)
    pub fn local_test() -> Self {
        Self {
            retransmit_interval_ms: 2,
            session_clear_delay_ms: 50,
            recv_poll_interval_ms: 10,
            admission_capacity: 16,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_reliable_and_unbounded() {
        let config = Config::default();
        assert_eq!(config.reliability, 1.0);
        assert!(config.max_retransmits.is_none());
        assert_eq!(config.admission_capacity, 512);
        assert_eq!(config.max_datagram_size(), 65507);
        assert_eq!(config.session_clear_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = Config {
            retransmit_interval_ms: 0,
            ..Config::default()
        };
        assert_eq!(config.retransmit_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_datagram_limit_follows_smaller_buffer() {
        let small = Config {
            recv_buffer_size: 1024,
            ..Config::default()
        };
        assert_eq!(small.max_datagram_size(), 1024);

        let oversized = Config {
            recv_buffer_size: 1 << 20,
            ..Config::default()
        };
        assert_eq!(oversized.max_datagram_size(), MAX_DATAGRAM_SIZE);
    }
}
