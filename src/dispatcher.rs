//! 디스패처
//!
//! 채널의 유일한 상위 소비자. 하나의 소켓을 공유하는 모든 세션으로 패킷을 나눈다.
//!
//! 세션 ID 별 상태 전이:
//!
//! ```text
//! UNKNOWN ──HELLO──▶ PENDING (큐 생성, 수락 큐에 게시)
//!                       │ register (슬롯 락 안에서 전환)
//!                       ▼
//!                   REGISTERED ──clear_session──▶ CLEARED
//! ```
//!
//! PENDING 동안 도착한 패킷은 슬롯 큐에 쌓이고, 세션이 등록된 직후
//! `fetch_pending` 으로 도착 순서대로 재생된다.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::channel::{DatagramSink, Link};
use crate::packet::Packet;
use crate::session::{resolve, Session};
use crate::stats::{DispatchStats, DispatchStatsSnapshot};
use crate::{Config, Error, Result, SessionId};

/// 수락 큐에 올라가는 신규 연결 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub remote_host: String,
    pub remote_port: u16,

    /// 피어가 HELLO 로 알린 세션 ID
    pub remote_id: SessionId,

    /// 이 연결에 새로 할당된 로컬 세션 ID
    pub local_id: SessionId,
}

impl ConnectionParameters {
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        resolve(&self.remote_host, self.remote_port)
    }
}

/// 등록 전 세션을 위해 보관한 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPacket {
    pub packet: Packet,
    pub source: SocketAddr,
}

/// PENDING 세션 ID 하나의 슬롯
///
/// 락이 "큐에 넣기" 와 "등록된 세션으로 바로 전달" 사이의 전환을 보호한다.
#[derive(Debug)]
struct HandshakeSlot {
    inner: Mutex<SlotInner>,
}

#[derive(Debug)]
struct SlotInner {
    queue: Vec<PendingPacket>,
    registered: bool,
}

impl HandshakeSlot {
    fn new(first: PendingPacket) -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                queue: vec![first],
                registered: false,
            }),
        }
    }
}

/// 세션 디멀티플렉서 겸 신규 연결 수락기
pub struct Dispatcher {
    link: Arc<dyn Link>,
    config: Config,

    /// 세션 ID -> 세션
    table: DashMap<SessionId, Arc<Session>>,

    /// 원격 세션 ID -> 핸드셰이크 슬롯
    slots: DashMap<SessionId, Arc<HandshakeSlot>>,

    /// 피어 ID 를 아직 모르는 발신 세션 (피어 주소별, 오래된 순)
    connecting: DashMap<SocketAddr, VecDeque<Arc<Session>>>,

    /// 할당된 로컬 세션 ID
    local_ids: DashSet<SessionId>,

    admission_tx: Sender<ConnectionParameters>,
    admission_rx: Receiver<ConnectionParameters>,

    stats: DispatchStats,
}

impl Dispatcher {
    /// 새 디스패처 생성
    pub fn new(link: Arc<dyn Link>, config: Config) -> Arc<Self> {
        let (admission_tx, admission_rx) = bounded(config.admission_capacity.max(1));

        Arc::new(Self {
            link,
            config,
            table: DashMap::new(),
            slots: DashMap::new(),
            connecting: DashMap::new(),
            local_ids: DashSet::new(),
            admission_tx,
            admission_rx,
            stats: DispatchStats::new(),
        })
    }

    /// 채널의 상위 소비자로 등록
    pub fn start(self: &Arc<Self>) {
        self.link.deliver_to(self.clone());
        info!(
            "dispatcher started (admission capacity {})",
            self.config.admission_capacity
        );
    }

    /// 발신 세션 열기
    pub fn open_session(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        local_id: SessionId,
    ) -> Result<Arc<Session>> {
        Session::open(self, host, port, local_id)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn link(&self) -> Arc<dyn Link> {
        self.link.clone()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// 등록된 세션 조회
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.table.get(&id).map(|entry| entry.value().clone())
    }

    /// 수락을 기다리는 연결 수
    pub fn pending_admissions(&self) -> usize {
        self.admission_rx.len()
    }

    /// `id -> session` 등록
    ///
    /// 같은 세션의 재등록은 무시. 해당 ID 의 핸드셰이크 슬롯이 있으면
    /// 슬롯 락 안에서 REGISTERED 로 전환한다.
    pub fn register(&self, session: &Arc<Session>, id: SessionId) -> Result<()> {
        let is_local = id == session.local_id();
        if is_local && self.slots.contains_key(&id) {
            return Err(Error::SessionIdInUse { session_id: id });
        }

        match self.table.entry(id) {
            Entry::Occupied(entry) => {
                if !Arc::ptr_eq(entry.get(), session) {
                    return Err(Error::SessionIdInUse { session_id: id });
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }

        if is_local {
            self.local_ids.insert(id);
        }

        let slot = self.slots.get(&id).map(|entry| entry.value().clone());
        if let Some(slot) = slot {
            slot.inner.lock().registered = true;
        }

        debug!("session {} registered under id {}", session.local_id(), id);
        Ok(())
    }

    /// 새 연결이 수락 큐에 올라올 때까지 블록
    pub fn accept(&self) -> Result<ConnectionParameters> {
        self.admission_rx.recv().map_err(|_| Error::ChannelError)
    }

    /// 시간 제한이 있는 accept. 시간 내에 없으면 None
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<ConnectionParameters>> {
        match self.admission_rx.recv_timeout(timeout) {
            Ok(params) => Ok(Some(params)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelError),
        }
    }

    /// 등록 전에 버퍼링된 패킷 (도착 순서). 큐는 비우지 않는다.
    pub fn fetch_pending(&self, remote_id: SessionId) -> Vec<PendingPacket> {
        let slot = self.slots.get(&remote_id).map(|entry| entry.value().clone());
        match slot {
            Some(slot) => slot.inner.lock().queue.clone(),
            None => Vec::new(),
        }
    }

    /// 세션 관련 항목 전부 제거 후 세션 종료
    pub fn clear_session(&self, local_id: SessionId, remote_id: Option<SessionId>) {
        let mut removed: Vec<Arc<Session>> = Vec::new();

        for id in std::iter::once(local_id).chain(remote_id) {
            if let Some((_, session)) = self.table.remove(&id) {
                if !removed.iter().any(|s| Arc::ptr_eq(s, &session)) {
                    removed.push(session);
                }
            }
            self.slots.remove(&id);
        }

        self.local_ids.remove(&local_id);
        self.connecting.retain(|_, waiting| {
            waiting.retain(|s| s.local_id() != local_id);
            !waiting.is_empty()
        });

        for session in &removed {
            session.shutdown();
        }

        info!("session {} cleared (remote {:?})", local_id, remote_id);
    }

    /// 피어 ID 를 모르는 발신 세션 등록
    ///
    /// 피어는 자신의 ID 로 HELLO 를 보내오므로, 그 주소에서 온 모르는 ID 의 HELLO 를
    /// 이 세션에 연결한다.
    ///
    /// 같은 주소로 대기 중인 세션이 여럿이면 오래된 순으로 연결되므로,
    /// 피어가 다른 순서로 응답하면 세션이 엇갈릴 수 있다.
    pub(crate) fn expect_peer_hello(&self, session: &Arc<Session>) {
        let peer = session.peer_addr();
        let mut waiting = self.connecting.entry(peer).or_default();
        waiting.push_back(session.clone());

        if waiting.len() > 1 {
            warn!(
                "{} 로 피어 ID 를 기다리는 세션 {} 개, HELLO 는 오래된 순으로 연결됨 (session {})",
                peer,
                waiting.len(),
                session.local_id()
            );
        }
    }

    /// 라우팅 알고리즘
    pub fn on_packet(&self, packet: &Packet, source: SocketAddr) {
        let id = packet.session_id();

        if let Some(session) = self.session(id) {
            self.stats.record_routed();
            session.on_packet(packet, source);
            return;
        }

        if packet.is_hello() {
            self.on_unknown_hello(packet, source);
            return;
        }

        let slot = self.slots.get(&id).map(|entry| entry.value().clone());
        let Some(slot) = slot else {
            self.stats.record_unknown_dropped();
            debug!("알 수 없는 세션 {}, 버림: {}", id, packet);
            return;
        };

        {
            let mut inner = slot.inner.lock();
            // 테이블 조회 이후 등록이 끝났을 수 있음
            if !inner.registered {
                inner.queue.push(PendingPacket {
                    packet: packet.clone(),
                    source,
                });
                self.stats.record_buffered();
                trace!("session {} pending, buffered {}", id, packet);
                return;
            }
        }

        match self.session(id) {
            Some(session) => {
                self.stats.record_routed();
                session.on_packet(packet, source);
            }
            None => self.stats.record_unknown_dropped(),
        }
    }

    fn on_unknown_hello(&self, packet: &Packet, source: SocketAddr) {
        let remote_id = packet.session_id();

        if let Some(session) = self.take_connecting(source) {
            match self.register(&session, remote_id) {
                Ok(()) => {
                    self.stats.record_routed();
                    session.on_packet(packet, source);
                }
                Err(e) => warn!("peer HELLO {} from {} not bound: {}", remote_id, source, e),
            }
            return;
        }

        if self.slots.contains_key(&remote_id) {
            // 아직 수락되지 않은 핸드셰이크의 재전송
            self.stats.record_duplicate_hello();
            trace!("duplicate HELLO for pending {}", remote_id);
            return;
        }

        if self.admission_tx.is_full() {
            self.stats.record_admission_dropped();
            warn!(
                "수락 큐 가득 참, HELLO {} from {} 버림 (피어가 재전송함)",
                remote_id, source
            );
            return;
        }

        let local_id = self.allocate_local_id();
        match self.slots.entry(remote_id) {
            Entry::Occupied(_) => {
                self.local_ids.remove(&local_id);
                self.stats.record_duplicate_hello();
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(HandshakeSlot::new(PendingPacket {
                    packet: packet.clone(),
                    source,
                })));
            }
        }

        let params = ConnectionParameters {
            remote_host: source.ip().to_string(),
            remote_port: source.port(),
            remote_id,
            local_id,
        };

        match self.admission_tx.try_send(params) {
            Ok(()) => {
                self.stats.record_admitted();
                info!(
                    "new connection from {} (remote id {}, local id {})",
                    source, remote_id, local_id
                );
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.slots.remove(&remote_id);
                self.local_ids.remove(&local_id);
                self.stats.record_admission_dropped();
                warn!("수락 큐 가득 참, HELLO {} from {} 버림", remote_id, source);
            }
        }
    }

    fn take_connecting(&self, source: SocketAddr) -> Option<Arc<Session>> {
        let found = {
            let mut waiting = self.connecting.get_mut(&source)?;
            let mut found = None;
            while let Some(session) = waiting.pop_front() {
                if session.remote_id().is_none() && !session.is_closed() {
                    found = Some(session);
                    break;
                }
            }
            found
        };
        self.connecting.remove_if(&source, |_, waiting| waiting.is_empty());
        found
    }

    /// 임의의 미사용 로컬 ID 할당
    fn allocate_local_id(&self) -> SessionId {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: SessionId = rng.gen_range(0..SessionId::MAX);
            if self.table.contains_key(&candidate) || self.slots.contains_key(&candidate) {
                continue;
            }
            if self.local_ids.insert(candidate) {
                return candidate;
            }
        }
    }
}

impl DatagramSink for Dispatcher {
    fn on_datagram(&self, payload: &str, source: SocketAddr) {
        match Packet::parse(payload) {
            Ok(packet) => self.on_packet(&packet, source),
            Err(e) => {
                self.stats.record_malformed_dropped();
                debug!("{} from {}", e, source);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sessions", &self.table.len())
            .field("pending", &self.slots.len())
            .field("admissions", &self.admission_rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::channel::mock::RecordingLink;
    use crate::session::MessageHandler;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Collector {
        bodies: Mutex<Vec<String>>,
    }

    impl MessageHandler for Collector {
        fn on_message(&self, _session: &Session, payload: &str, _source: &str) {
            self.bodies.lock().push(payload.to_string());
        }
    }

    fn client() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn dispatcher_with(link: &Arc<RecordingLink>, capacity: usize) -> Arc<Dispatcher> {
        let config = Config {
            admission_capacity: capacity,
            ..Config::local_test()
        };
        Dispatcher::new(link.clone(), config)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_start_registers_as_link_consumer() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);
        assert!(!link.has_sink());
        dispatcher.start();
        assert!(link.has_sink());
    }

    #[test]
    fn test_malformed_and_unknown_packets_are_dropped() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);

        dispatcher.on_datagram("garbage", client());
        dispatcher.on_datagram("1;x;ACK", client());
        dispatcher.on_datagram("99;3;data for nobody", client());
        dispatcher.on_datagram("99;3;ACK", client());

        let stats = dispatcher.stats();
        assert_eq!(stats.malformed_dropped, 2);
        assert_eq!(stats.unknown_dropped, 2);
        assert_eq!(dispatcher.pending_admissions(), 0);
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_hello_is_admitted_once() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);

        dispatcher.on_datagram("7;0;HELLO", client());
        dispatcher.on_datagram("7;0;HELLO", client());

        let params = dispatcher.accept_timeout(WAIT).unwrap().unwrap();
        assert_eq!(params.remote_id, 7);
        assert_eq!(params.remote_host, "127.0.0.1");
        assert_eq!(params.remote_port, 4000);
        assert_ne!(params.local_id, 7);
        assert_eq!(dispatcher.accept_timeout(Duration::from_millis(10)).unwrap(), None);
        assert_eq!(dispatcher.stats().duplicate_hellos, 1);
        assert_eq!(dispatcher.fetch_pending(7).len(), 1);
    }

    #[test]
    fn test_full_admission_queue_drops_then_readmits_on_retry() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 1);

        dispatcher.on_datagram("7;0;HELLO", client());
        dispatcher.on_datagram("8;0;HELLO", "127.0.0.1:4001".parse().unwrap());

        assert_eq!(dispatcher.pending_admissions(), 1);
        assert_eq!(dispatcher.stats().admission_dropped, 1);
        assert!(dispatcher.fetch_pending(8).is_empty());

        let first = dispatcher.accept().unwrap();
        assert_eq!(first.remote_id, 7);

        // 피어의 HELLO 재전송이 다시 고려됨
        dispatcher.on_datagram("8;0;HELLO", "127.0.0.1:4001".parse().unwrap());
        let second = dispatcher.accept_timeout(WAIT).unwrap().unwrap();
        assert_eq!(second.remote_id, 8);
        assert_eq!(second.remote_port, 4001);
    }

    #[test]
    fn test_message_arriving_before_registration_is_not_lost() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);

        dispatcher.on_datagram("7;0;HELLO", client());
        let params = dispatcher.accept().unwrap();

        // 수락 이후, 세션 등록 전에 도착
        dispatcher.on_datagram("7;1;early bird", client());
        assert_eq!(dispatcher.stats().buffered, 1);

        let collector = Arc::new(Collector::default());
        let session = Session::accept(&dispatcher, &params, &collector).unwrap();

        assert_eq!(*collector.bodies.lock(), vec!["early bird"]);
        assert_eq!(session.remote_id(), Some(7));
        assert_eq!(session.remote_seq(), Some(1));
        assert_eq!(link.count("7;0;ACK"), 1);
        assert_eq!(link.count("7;1;ACK"), 1);

        // 이후 패킷은 바로 라우팅
        dispatcher.on_datagram("7;2;direct", client());
        assert_eq!(*collector.bodies.lock(), vec!["early bird", "direct"]);
    }

    #[test]
    fn test_registration_race_delivers_every_message_once() {
        for _ in 0..50 {
            let link = RecordingLink::new();
            let dispatcher = dispatcher_with(&link, 4);
            dispatcher.on_datagram("7;0;HELLO", client());
            let params = dispatcher.accept().unwrap();

            let reader = {
                let dispatcher = dispatcher.clone();
                thread::spawn(move || {
                    for seq in 1..=5 {
                        dispatcher.on_datagram(&format!("7;{seq};m{seq}"), client());
                    }
                })
            };

            let collector = Arc::new(Collector::default());
            let _session = Session::accept(&dispatcher, &params, &collector).unwrap();
            reader.join().unwrap();

            // 등록 이전 패킷은 재생되고 이후 패킷은 직접 전달됨. 순서가 어긋나 버려진 것은
            // 확인만 되었으므로 피어의 재전송으로 이어진다. 중복 전달은 없어야 한다.
            let bodies = collector.bodies.lock().clone();
            let expected: Vec<String> = (1..=bodies.len()).map(|i| format!("m{i}")).collect();
            assert_eq!(bodies, expected);

            dispatcher.clear_session(params.local_id, Some(params.remote_id));
        }
    }

    #[test]
    fn test_accepted_session_is_registered_under_both_ids() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);
        dispatcher.on_datagram("7;0;HELLO", client());
        let params = dispatcher.accept().unwrap();

        let collector = Arc::new(Collector::default());
        let session = Session::accept(&dispatcher, &params, &collector).unwrap();

        assert!(Arc::ptr_eq(&dispatcher.session(7).unwrap(), &session));
        assert!(Arc::ptr_eq(
            &dispatcher.session(params.local_id).unwrap(),
            &session
        ));

        // 서버측 HELLO 가 나가고, 피어의 ACK 로 확인됨
        let hello = format!("{};0;HELLO", params.local_id);
        assert!(link.wait_for(WAIT, |sent| sent.contains(&hello)));
        dispatcher.on_datagram(&format!("{};0;ACK", params.local_id), client());
        assert!(wait_until(|| session.is_established()));
    }

    #[test]
    fn test_clear_session_removes_everything() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);
        dispatcher.on_datagram("7;0;HELLO", client());
        let params = dispatcher.accept().unwrap();
        let collector = Arc::new(Collector::default());
        let session = Session::accept(&dispatcher, &params, &collector).unwrap();

        dispatcher.clear_session(params.local_id, Some(params.remote_id));

        assert!(dispatcher.session(7).is_none());
        assert!(dispatcher.session(params.local_id).is_none());
        assert!(dispatcher.fetch_pending(7).is_empty());
        assert!(session.is_closed());

        // 정리 이후의 데이터는 알 수 없는 세션
        dispatcher.on_datagram("7;1;late", client());
        assert_eq!(dispatcher.stats().unknown_dropped, 1);
        assert!(collector.bodies.lock().is_empty());

        // 같은 원격 ID 의 새 HELLO 는 새 연결로 취급
        dispatcher.on_datagram("7;0;HELLO", client());
        assert!(dispatcher.accept_timeout(WAIT).unwrap().is_some());
    }

    #[test]
    fn test_peer_hello_binds_outbound_session() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);
        let session = dispatcher.open_session("127.0.0.1", 4000, 42).unwrap();

        dispatcher.on_datagram("900;0;HELLO", client());

        assert_eq!(session.remote_id(), Some(900));
        assert!(Arc::ptr_eq(&dispatcher.session(900).unwrap(), &session));
        assert_eq!(dispatcher.pending_admissions(), 0);
        assert_eq!(link.count("900;0;ACK"), 1);

        // 다른 주소의 HELLO 는 신규 연결
        dispatcher.on_datagram("901;0;HELLO", "127.0.0.1:4001".parse().unwrap());
        assert_eq!(dispatcher.pending_admissions(), 1);
    }

    #[test]
    fn test_peer_hellos_bind_waiting_sessions_oldest_first() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);
        let older = dispatcher.open_session("127.0.0.1", 4000, 42).unwrap();
        let newer = dispatcher.open_session("127.0.0.1", 4000, 43).unwrap();

        dispatcher.on_datagram("900;0;HELLO", client());
        assert_eq!(older.remote_id(), Some(900));
        assert_eq!(newer.remote_id(), None);

        dispatcher.on_datagram("901;0;HELLO", client());
        assert_eq!(newer.remote_id(), Some(901));
        assert!(Arc::ptr_eq(&dispatcher.session(901).unwrap(), &newer));

        // 둘 다 연결된 뒤 같은 주소의 새 HELLO 는 신규 연결
        dispatcher.on_datagram("902;0;HELLO", client());
        assert_eq!(dispatcher.pending_admissions(), 1);
    }

    #[test]
    fn test_duplicate_local_id_is_rejected() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 4);
        let _first = dispatcher.open_session("127.0.0.1", 4000, 42).unwrap();
        assert!(matches!(
            dispatcher.open_session("127.0.0.1", 4000, 42),
            Err(Error::SessionIdInUse { session_id: 42 })
        ));
    }

    #[test]
    fn test_allocated_ids_are_unique() {
        let link = RecordingLink::new();
        let dispatcher = dispatcher_with(&link, 64);
        for remote in 0..64 {
            dispatcher.on_datagram(&format!("{remote};0;HELLO"), client());
        }

        let mut ids = std::collections::HashSet::new();
        while let Some(params) = dispatcher.accept_timeout(Duration::from_millis(10)).unwrap() {
            assert!(params.local_id >= 0);
            assert!(ids.insert(params.local_id));
        }
        assert_eq!(ids.len(), 64);
    }
}
