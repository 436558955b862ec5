//! 세션/디스패처 통계
//!
//! 수신 스레드와 애플리케이션 스레드가 동시에 갱신하므로 원자 카운터 사용

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 세션별 카운터
#[derive(Debug)]
pub struct SessionStats {
    /// 생성 시간
    start_time: Instant,

    /// 전송한 데이터그램 수 (최초 + 재전송)
    transmissions: AtomicU64,

    /// 재전송 수
    retransmissions: AtomicU64,

    /// 확인된 메시지 수 (HELLO 포함)
    acked_messages: AtomicU64,

    /// 보낸 ACK 수
    acks_sent: AtomicU64,

    /// 상위로 전달한 메시지 수
    delivered: AtomicU64,

    /// 중복/순서 어긋남으로 전달하지 않은 메시지 수
    duplicates: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            transmissions: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            acked_messages: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// 전송 기록 (첫 시도가 아니면 재전송으로도 센다)
    pub fn record_transmission(&self, attempt: u32) {
        self.transmissions.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.retransmissions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_acked(&self) {
        self.acked_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            elapsed: self.start_time.elapsed(),
            transmissions: self.transmissions.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            acked_messages: self.acked_messages.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 세션 통계 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub elapsed: Duration,
    pub transmissions: u64,
    pub retransmissions: u64,
    pub acked_messages: u64,
    pub acks_sent: u64,
    pub delivered: u64,
    pub duplicates: u64,
}

impl SessionStatsSnapshot {
    /// 재전송 비율 (전체 전송 대비)
    pub fn retransmission_ratio(&self) -> f64 {
        if self.transmissions == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.transmissions as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} (retx {:.1}%) | Acked: {} | ACKs out: {} | Delivered: {} | Dup: {}",
            self.elapsed.as_secs_f64(),
            self.transmissions,
            self.retransmission_ratio() * 100.0,
            self.acked_messages,
            self.acks_sent,
            self.delivered,
            self.duplicates,
        )
    }
}

/// 디스패처 카운터
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// 등록된 세션으로 바로 전달한 패킷
    routed: AtomicU64,

    /// 등록 전 세션을 위해 버퍼링한 패킷
    buffered: AtomicU64,

    /// 수락 큐에 올린 신규 연결
    admitted: AtomicU64,

    /// 수락 큐가 가득 차서 버린 HELLO
    admission_dropped: AtomicU64,

    /// 대기 중인 핸드셰이크의 중복 HELLO
    duplicate_hellos: AtomicU64,

    /// 알 수 없는 세션의 패킷
    unknown_dropped: AtomicU64,

    /// 파싱 실패 패킷
    malformed_dropped: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_dropped(&self) {
        self.admission_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_hello(&self) {
        self.duplicate_hellos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_dropped(&self) {
        self.unknown_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_dropped(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            routed: self.routed.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            admission_dropped: self.admission_dropped.load(Ordering::Relaxed),
            duplicate_hellos: self.duplicate_hellos.load(Ordering::Relaxed),
            unknown_dropped: self.unknown_dropped.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
        }
    }
}

/// 디스패처 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub routed: u64,
    pub buffered: u64,
    pub admitted: u64,
    pub admission_dropped: u64,
    pub duplicate_hellos: u64,
    pub unknown_dropped: u64,
    pub malformed_dropped: u64,
}

impl DispatchStatsSnapshot {
    /// 버린 패킷 합계
    pub fn total_dropped(&self) -> u64 {
        self.admission_dropped + self.duplicate_hellos + self.unknown_dropped + self.malformed_dropped
    }

    pub fn summary(&self) -> String {
        format!(
            "Routed: {} | Buffered: {} | Admitted: {} | Dropped: {} (full {}, dup-hello {}, unknown {}, malformed {})",
            self.routed,
            self.buffered,
            self.admitted,
            self.total_dropped(),
            self.admission_dropped,
            self.duplicate_hellos,
            self.unknown_dropped,
            self.malformed_dropped,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmissions_count_only_repeated_attempts() {
        let stats = SessionStats::new();
        stats.record_transmission(1);
        stats.record_transmission(2);
        stats.record_transmission(3);
        stats.record_transmission(1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.transmissions, 4);
        assert_eq!(snapshot.retransmissions, 2);
        assert!((snapshot.retransmission_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dispatch_drop_total() {
        let stats = DispatchStats::new();
        stats.record_malformed_dropped();
        stats.record_unknown_dropped();
        stats.record_admission_dropped();
        stats.record_routed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_dropped(), 3);
        assert!(snapshot.summary().contains("Routed: 1"));
    }
}
