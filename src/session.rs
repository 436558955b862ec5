//! 연결 세션 (connected layer)
//!
//! - 피어 하나와의 논리적 대화 하나
//! - stop-and-wait: 동시에 확인 대기 중인 메시지는 최대 하나
//! - ACK 가 올 때까지 같은 패킷을 주기적으로 재전송
//! - 순서대로 도착한 메시지만 상위 핸들러로 전달
//!
//! HELLO 는 seq 0 을 차지하며 백그라운드 스레드에서 확인될 때까지 재전송된다.
//! 첫 애플리케이션 메시지는 seq 1 이다.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, trace, warn};

use crate::channel::Link;
use crate::dispatcher::{ConnectionParameters, Dispatcher};
use crate::packet::{is_reserved, Packet};
use crate::stats::{SessionStats, SessionStatsSnapshot};
use crate::{Error, Result, Seq, SessionId};

/// 세션이 순서대로 받은 메시지를 소비하는 상위 계층
///
/// 채널 수신 스레드에서 호출되므로 오래 블록하면 안 된다.
/// 특히 같은 세션의 `send_message` 를 여기서 부르면 ACK 를 처리할 스레드가 없어 멈춘다.
pub trait MessageHandler: Send + Sync {
    /// `source` 는 `<peer addr> @<session id> [<seq>]` 형식
    fn on_message(&self, session: &Session, payload: &str, source: &str);
}

/// 세션 가변 상태
#[derive(Debug)]
struct SessionState {
    /// 다음에 보낼 seq
    local_seq: Seq,

    /// 확인 대기 중인 seq
    in_flight: Option<Seq>,

    /// 피어의 세션 ID (HELLO 로 학습)
    remote_id: Option<SessionId>,

    /// 피어로부터 순서대로 받은 마지막 seq
    remote_seq: Option<Seq>,

    /// 정리됨 또는 재전송 포기
    closed: bool,
}

/// 연결 세션
pub struct Session {
    local_id: SessionId,
    peer: SocketAddr,
    link: Arc<dyn Link>,
    dispatcher: Weak<Dispatcher>,

    retransmit_interval: Duration,
    max_retransmits: Option<u32>,
    max_datagram: usize,
    clear_delay: Duration,

    state: Mutex<SessionState>,

    /// ACK 수신 또는 종료 시 깨움
    slot_released: Condvar,

    /// 순서 검사와 상위 전달을 묶음
    delivery: Mutex<()>,

    handler: RwLock<Option<Weak<dyn MessageHandler>>>,
    clear_requested: AtomicBool,
    stats: SessionStats,
}

impl Session {
    fn new(
        dispatcher: &Arc<Dispatcher>,
        peer: SocketAddr,
        local_id: SessionId,
        remote_id: Option<SessionId>,
    ) -> Self {
        let config = dispatcher.config();
        Self {
            local_id,
            peer,
            link: dispatcher.link(),
            dispatcher: Arc::downgrade(dispatcher),
            retransmit_interval: config.retransmit_interval(),
            max_retransmits: config.max_retransmits,
            max_datagram: config.max_datagram_size(),
            clear_delay: config.session_clear_delay(),
            state: Mutex::new(SessionState {
                local_seq: 0,
                in_flight: None,
                remote_id,
                remote_seq: None,
                closed: false,
            }),
            slot_released: Condvar::new(),
            delivery: Mutex::new(()),
            handler: RwLock::new(None),
            clear_requested: AtomicBool::new(false),
            stats: SessionStats::new(),
        }
    }

    /// 발신 세션 생성
    ///
    /// `local_id` 로 디스패처에 등록하고 HELLO 를 보낸 뒤 바로 반환한다.
    /// 핸드셰이크는 피어의 ACK/HELLO 가 도착하면 비동기로 완료된다.
    pub fn open(
        dispatcher: &Arc<Dispatcher>,
        host: &str,
        port: u16,
        local_id: SessionId,
    ) -> Result<Arc<Self>> {
        let peer = resolve(host, port)?;
        let session = Arc::new(Self::new(dispatcher, peer, local_id, None));

        dispatcher.register(&session, local_id)?;
        dispatcher.expect_peer_hello(&session);
        session.start_handshake()?;

        info!("session {} opened to {}", local_id, peer);
        Ok(session)
    }

    /// 디스패처가 수락한 수신 세션 생성
    ///
    /// 로컬/원격 ID 둘 다로 등록하고, 등록 전에 버퍼링된 패킷을 도착 순서대로 재생한다.
    pub fn accept<H: MessageHandler + 'static>(
        dispatcher: &Arc<Dispatcher>,
        params: &ConnectionParameters,
        handler: &Arc<H>,
    ) -> Result<Arc<Self>> {
        let peer = params.peer_addr()?;
        let session = Arc::new(Self::new(
            dispatcher,
            peer,
            params.local_id,
            Some(params.remote_id),
        ));
        session.bind_upward(handler);

        dispatcher.register(&session, params.local_id)?;
        dispatcher.register(&session, params.remote_id)?;

        for pending in dispatcher.fetch_pending(params.remote_id) {
            session.on_packet(&pending.packet, pending.source);
        }

        session.start_handshake()?;

        info!(
            "session {} accepted from {} (remote id {})",
            params.local_id, peer, params.remote_id
        );
        Ok(session)
    }

    pub fn local_id(&self) -> SessionId {
        self.local_id
    }

    pub fn remote_id(&self) -> Option<SessionId> {
        self.state.lock().remote_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 다음에 보낼 seq
    pub fn local_seq(&self) -> Seq {
        self.state.lock().local_seq
    }

    pub fn remote_seq(&self) -> Option<Seq> {
        self.state.lock().remote_seq
    }

    /// 자신의 HELLO 가 확인되고 피어 ID 를 알고 있으면 true
    pub fn is_established(&self) -> bool {
        let state = self.state.lock();
        state.remote_id.is_some() && state.local_seq > 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    /// 상위 핸들러 지정 (약한 참조만 보관)
    pub fn bind_upward<H: MessageHandler + 'static>(&self, handler: &Arc<H>) {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn MessageHandler> = weak;
        *self.handler.write() = Some(weak);
    }

    /// 상위 핸들러 해제
    ///
    /// 진행 중인 송신은 취소하지 않는다.
    pub fn close(&self) {
        self.handler.write().take();
        debug!("session {} closed by upper layer", self.local_id);
    }

    /// 메시지를 보내고 피어가 확인할 때까지 블록
    ///
    /// `max_retransmits` 가 None 이면 전부 손실될 경우 영원히 블록한다.
    /// 인코딩된 패킷이 데이터그램 한도를 넘으면 보내지 않고 에러.
    pub fn send_message(&self, body: &str) -> Result<()> {
        if is_reserved(body) {
            return Err(Error::ReservedPayload {
                payload: body.to_string(),
            });
        }

        let seq = self.claim_slot()?;
        let wire = Packet::data(self.local_id, seq, body).encode();
        if wire.len() > self.max_datagram {
            self.release_slot(&mut self.state.lock());
            return Err(Error::PayloadTooLarge {
                size: wire.len(),
                max: self.max_datagram,
            });
        }
        self.transmit_until_acked(seq, &wire)
    }

    /// 유예 시간 뒤 디스패처에서 이 세션을 정리하도록 예약
    ///
    /// 마지막 ACK 의 재전송 요청을 유예 시간 동안 계속 처리하기 위함. 두 번째 호출부터는 무시.
    pub fn request_clear(&self) -> Result<()> {
        if self.clear_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let dispatcher = self.dispatcher.clone();
        let local_id = self.local_id;
        let remote_id = self.remote_id();
        let delay = self.clear_delay;

        thread::Builder::new()
            .name(format!("rudp-clear-{local_id}"))
            .spawn(move || {
                thread::sleep(delay);
                if let Some(dispatcher) = dispatcher.upgrade() {
                    dispatcher.clear_session(local_id, remote_id);
                }
            })?;

        debug!("session {} clear scheduled in {:?}", local_id, delay);
        Ok(())
    }

    /// 디스패처가 라우팅한 패킷 처리
    pub fn on_packet(&self, packet: &Packet, source: SocketAddr) {
        match packet {
            Packet::Ack { session_id, seq } => self.on_ack(*session_id, *seq),
            Packet::Hello { session_id, seq } => self.on_hello(*session_id, *seq),
            Packet::Data {
                session_id,
                seq,
                body,
            } => self.on_data(*session_id, *seq, body, source),
        }
    }

    /// 정리 시 호출: 재전송 루프와 대기자를 깨워 종료시킴
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.slot_released.notify_all();
    }

    fn on_ack(&self, session_id: SessionId, seq: Seq) {
        let mut state = self.state.lock();
        if session_id == self.local_id && state.in_flight == Some(seq) {
            state.in_flight = None;
            state.local_seq = seq.wrapping_add(1);
            self.stats.record_acked();
            self.slot_released.notify_all();
            trace!("session {}: seq {} acked", self.local_id, seq);
        } else {
            trace!(
                "session {}: stale ack {};{} ignored",
                self.local_id,
                session_id,
                seq
            );
        }
    }

    fn on_hello(&self, session_id: SessionId, seq: Seq) {
        let matches = {
            let mut state = self.state.lock();
            if state.remote_id.is_none() {
                state.remote_id = Some(session_id);
                debug!("session {}: peer id {} learned", self.local_id, session_id);
            }
            if state.remote_id == Some(session_id) {
                if state.remote_seq.is_none() {
                    state.remote_seq = Some(0);
                }
                true
            } else {
                false
            }
        };

        if matches {
            self.send_ack(session_id, seq);
        } else {
            debug!(
                "session {}: HELLO from foreign id {} ignored",
                self.local_id, session_id
            );
        }
    }

    fn on_data(&self, session_id: SessionId, seq: Seq, body: &str, source: SocketAddr) {
        // 중복/순서 어긋남이어도 피어의 stop-and-wait 를 풀어주기 위해 항상 확인
        self.send_ack(session_id, seq);

        let _delivery = self.delivery.lock();
        let in_order = {
            let mut state = self.state.lock();
            let expected = state.remote_seq.map(|last| last.wrapping_add(1));
            if state.remote_id == Some(session_id) && expected == Some(seq) {
                state.remote_seq = Some(seq);
                true
            } else {
                false
            }
        };

        if !in_order {
            self.stats.record_duplicate();
            trace!(
                "session {}: {};{} not in order, not delivered",
                self.local_id,
                session_id,
                seq
            );
            return;
        }

        match self.upward() {
            Some(handler) => {
                let annotated = format!("{source} @{session_id} [{seq}]");
                handler.on_message(self, body, &annotated);
                self.stats.record_delivered();
            }
            None => debug!(
                "session {}: no upper layer, message {} dropped",
                self.local_id, seq
            ),
        }
    }

    fn upward(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    fn send_ack(&self, session_id: SessionId, seq: Seq) {
        self.link.send(&Packet::ack(session_id, seq).encode(), self.peer);
        self.stats.record_ack_sent();
    }

    /// HELLO(seq 0) 슬롯을 즉시 점유하고 재전송은 백그라운드에서
    fn start_handshake(self: &Arc<Self>) -> Result<()> {
        let seq = self.claim_slot()?;
        let wire = Packet::hello(self.local_id, seq).encode();
        let session = self.clone();

        thread::Builder::new()
            .name(format!("rudp-hello-{}", self.local_id))
            .spawn(move || {
                if let Err(e) = session.transmit_until_acked(seq, &wire) {
                    debug!("session {}: handshake abandoned: {}", session.local_id, e);
                }
            })?;

        Ok(())
    }

    /// 송신 슬롯이 빌 때까지 기다렸다가 다음 seq 로 점유
    fn claim_slot(&self) -> Result<Seq> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::SessionClosed {
                    session_id: self.local_id,
                });
            }
            if state.in_flight.is_none() {
                break;
            }
            self.slot_released.wait(&mut state);
        }

        let seq = state.local_seq;
        state.in_flight = Some(seq);
        Ok(seq)
    }

    /// ACK 가 올 때까지 재전송 루프
    ///
    /// while 확인 대기 && 취소 안 됨: 전송, interval 동안 대기
    fn transmit_until_acked(&self, seq: Seq, wire: &str) -> Result<()> {
        let mut attempts: u32 = 0;
        let mut state = self.state.lock();

        loop {
            if state.in_flight != Some(seq) {
                return Ok(());
            }

            if state.closed {
                self.release_slot(&mut state);
                return Err(Error::SessionClosed {
                    session_id: self.local_id,
                });
            }

            if let Some(max) = self.max_retransmits {
                if attempts > max {
                    // 피어가 이 seq 를 받았는지 알 수 없으므로 세션은 더 쓸 수 없음
                    state.closed = true;
                    self.release_slot(&mut state);
                    warn!(
                        "session {}: seq {} unacknowledged after {} attempts",
                        self.local_id, seq, attempts
                    );
                    return Err(Error::RetriesExhausted {
                        session_id: self.local_id,
                        seq,
                        attempts,
                    });
                }
            }

            attempts += 1;
            MutexGuard::unlocked(&mut state, || self.link.send(wire, self.peer));
            self.stats.record_transmission(attempts);
            if attempts > 1 {
                trace!("session {}: retransmit #{} {}", self.local_id, attempts - 1, wire);
            }

            if state.in_flight == Some(seq) && !state.closed {
                self.slot_released
                    .wait_for(&mut state, self.retransmit_interval);
            }
        }
    }

    fn release_slot(&self, state: &mut SessionState) {
        state.in_flight = None;
        self.slot_released.notify_all();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_id", &self.local_id)
            .field("peer", &self.peer)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// (host, port) 를 소켓 주소로 해석 (IPv4 우선)
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let unresolved = || Error::AddressResolution {
        host: host.to_string(),
        port,
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(unresolved)
}
