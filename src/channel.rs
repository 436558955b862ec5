//! 비신뢰 데이터그램 채널
//!
//! - 로컬 UDP 소켓 하나로 송수신
//! - 설정된 신뢰도에 따라 송신을 임의로 버려 손실을 시뮬레이션
//! - 수신은 백그라운드 스레드 하나가 상위 소비자 하나에게 전달

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::{Config, Error, Result};

/// 수신 데이터그램 소비자
///
/// 수신 스레드에서 동기적으로 호출되므로 오래 블록하면 안 된다.
pub trait DatagramSink: Send + Sync {
    fn on_datagram(&self, payload: &str, source: SocketAddr);
}

/// 세션 계층이 사용하는 하위 링크
pub trait Link: Send + Sync {
    /// best-effort 송신. 실패하거나 버려져도 호출자에게 알리지 않음
    fn send(&self, payload: &str, dest: SocketAddr);

    /// 상위 소비자 등록 (기존 소비자를 대체)
    fn deliver_to(&self, sink: Arc<dyn DatagramSink>);
}

type SharedSink = Arc<RwLock<Option<Arc<dyn DatagramSink>>>>;

/// UDP 기반 비신뢰 채널
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,

    /// 송신이 실제로 나갈 확률
    reliability: RwLock<f64>,

    sink: SharedSink,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpChannel {
    /// 소켓 바인딩 후 수신 스레드 시작
    pub fn bind(bind_addr: SocketAddr, config: &Config) -> Result<Arc<Self>> {
        validate_reliability(config.reliability)?;

        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(config.recv_poll_interval()))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let sink: SharedSink = Arc::new(RwLock::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let socket = socket.clone();
            let sink = sink.clone();
            let running = running.clone();
            let buffer_size = config.recv_buffer_size;
            thread::Builder::new()
                .name("rudp-channel-recv".into())
                .spawn(move || receive_loop(socket, sink, running, buffer_size))?
        };

        info!("UDP channel bound on {}", local_addr);

        Ok(Arc::new(Self {
            socket,
            local_addr,
            reliability: RwLock::new(config.reliability),
            sink,
            running,
            receiver: Mutex::new(Some(handle)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reliability(&self) -> f64 {
        *self.reliability.read()
    }

    /// 손실 확률 변경 (1.0 - reliability 가 손실률)
    pub fn set_reliability(&self, value: f64) -> Result<()> {
        validate_reliability(value)?;
        *self.reliability.write() = value;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 소켓 해제 및 수신 스레드 정지
    ///
    /// 진행 중인 콜백은 버려질 수 있음
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.sink.write().take();

        if let Some(handle) = self.receiver.lock().take() {
            // 수신 스레드 자신이 close 를 부른 경우 join 하지 않음
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("수신 스레드 비정상 종료");
            }
        }
        info!("UDP channel on {} closed", self.local_addr);
    }
}

impl Link for UdpChannel {
    fn send(&self, payload: &str, dest: SocketAddr) {
        if !self.is_running() {
            return;
        }

        let reliability = self.reliability();
        if !rand::thread_rng().gen_bool(reliability) {
            trace!("simulated loss: {:?} -> {}", payload, dest);
            return;
        }

        if let Err(e) = self.socket.send_to(payload.as_bytes(), dest) {
            warn!("송신 실패 ({}): {}", dest, e);
        }
    }

    fn deliver_to(&self, sink: Arc<dyn DatagramSink>) {
        *self.sink.write() = Some(sink);
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_reliability(value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidReliability { value })
    }
}

/// 수신 루프
///
/// 버퍼를 한 바이트 크게 잡아, 채워지면 잘린 데이터그램으로 보고 버린다.
fn receive_loop(socket: Arc<UdpSocket>, sink: SharedSink, running: Arc<AtomicBool>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size + 1];

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, source)) if len > buffer_size => {
                warn!(
                    "데이터그램이 수신 버퍼({} 바이트)보다 큼, 버림 from {}",
                    buffer_size, source
                );
            }
            Ok((len, source)) => {
                let payload = String::from_utf8_lossy(&buf[..len]);
                // 락을 잡은 채로 콜백하지 않도록 복제
                let consumer = sink.read().clone();
                match consumer {
                    Some(consumer) => consumer.on_datagram(&payload, source),
                    None => debug!("no consumer, dropped datagram from {}", source),
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            // ICMP port unreachable 이 다음 recv 에서 보고되는 플랫폼이 있음
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                debug!("수신 에러 무시: {}", e);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    warn!("수신 에러, 수신 스레드 종료: {}", e);
                }
                break;
            }
        }
    }

    debug!("receive loop stopped");
}


#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    struct Collector(Mutex<mpsc::Sender<(String, SocketAddr)>>);

    impl DatagramSink for Collector {
        fn on_datagram(&self, payload: &str, source: SocketAddr) {
            let _ = self.0.lock().send((payload.to_string(), source));
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_delivers_to_registered_sink() {
        let config = Config::local_test();
        let a = UdpChannel::bind(loopback(), &config).unwrap();
        let b = UdpChannel::bind(loopback(), &config).unwrap();

        let (tx, rx) = mpsc::channel();
        b.deliver_to(Arc::new(Collector(Mutex::new(tx))));

        a.send("1;0;HELLO", b.local_addr());
        let (payload, source) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(payload, "1;0;HELLO");
        assert_eq!(source, a.local_addr());

        a.close();
        b.close();
        assert!(!b.is_running());
    }

    #[test]
    fn test_zero_reliability_drops_everything() {
        let config = Config::local_test();
        let a = UdpChannel::bind(loopback(), &config).unwrap();
        let b = UdpChannel::bind(loopback(), &config).unwrap();
        a.set_reliability(0.0).unwrap();

        let (tx, rx) = mpsc::channel();
        b.deliver_to(Arc::new(Collector(Mutex::new(tx))));

        for _ in 0..20 {
            a.send("lost", b.local_addr());
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_reliability() {
        let config = Config::local_test();
        let channel = UdpChannel::bind(loopback(), &config).unwrap();
        assert!(matches!(
            channel.set_reliability(1.5),
            Err(Error::InvalidReliability { .. })
        ));
        assert_eq!(channel.reliability(), 1.0);

        let bad = Config {
            reliability: -0.1,
            ..Config::local_test()
        };
        assert!(UdpChannel::bind(loopback(), &bad).is_err());
    }

    #[test]
    fn test_oversized_datagram_is_dropped_not_truncated() {
        let a = UdpChannel::bind(loopback(), &Config::local_test()).unwrap();
        let small = Config {
            recv_buffer_size: 32,
            ..Config::local_test()
        };
        let b = UdpChannel::bind(loopback(), &small).unwrap();

        let (tx, rx) = mpsc::channel();
        b.deliver_to(Arc::new(Collector(Mutex::new(tx))));

        let too_big = format!("1;1;{}", "x".repeat(36));
        let fits = format!("1;2;{}", "y".repeat(28));
        assert_eq!(too_big.len(), 40);
        assert_eq!(fits.len(), 32);

        a.send(&too_big, b.local_addr());
        a.send(&fits, b.local_addr());

        let (payload, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(payload, fits);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let channel = UdpChannel::bind(loopback(), &Config::local_test()).unwrap();
        channel.close();
        channel.close();
        assert!(!channel.is_running());
    }
}
