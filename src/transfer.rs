//! 줄 단위 파일 전송
//!
//! 세션 위에서 동작하는 애플리케이션 계층
//!
//! ```text
//! SEND <name>      헤더
//! <line>           파일의 각 줄 (줄바꿈 제외)
//! **CLOSE**        종료
//! ```
//!
//! 수신측은 출력 디렉토리에 `_received_<name>` 으로 저장하고, 종료 표식을 받으면
//! 세션 정리를 예약한다. 정리를 바로 하지 않는 이유는 종료 표식에 대한 ACK 가
//! 손실되면 송신측이 재전송하기 때문이다.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::dispatcher::{ConnectionParameters, Dispatcher};
use crate::session::{MessageHandler, Session};
use crate::stats::SessionStatsSnapshot;
use crate::{Error, Result, SessionId, CLOSE_MESSAGE, SEND_PREFIX};

/// 수신 파일 이름 접두어
const RECEIVED_PREFIX: &str = "_received_";

/// 파일 송신자
pub struct FileSender {
    session: Arc<Session>,
    name: String,
    lines_sent: u64,
}

impl FileSender {
    /// 임의의 세션 ID 로 세션을 열고 헤더 전송
    pub fn open(dispatcher: &Arc<Dispatcher>, host: &str, port: u16, name: &str) -> Result<Self> {
        let session = open_with_random_id(dispatcher, host, port)?;
        session.send_message(&format!("{SEND_PREFIX}{name}"))?;

        debug!("transfer of {} started on session {}", name, session.local_id());
        Ok(Self {
            session,
            name: name.to_string(),
            lines_sent: 0,
        })
    }

    /// 파일 하나를 줄 단위로 전송하고 종료
    pub fn send_file(
        dispatcher: &Arc<Dispatcher>,
        host: &str,
        port: u16,
        path: &Path,
    ) -> Result<SessionStatsSnapshot> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Transfer(format!("파일 이름 없음: {}", path.display())))?;
        let reader = BufReader::new(File::open(path)?);

        let mut sender = Self::open(dispatcher, host, port, name)?;
        for line in reader.lines() {
            sender.send_line(&line?)?;
        }
        sender.finish()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn lines_sent(&self) -> u64 {
        self.lines_sent
    }

    /// 한 줄 전송 (확인될 때까지 블록)
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        if line == CLOSE_MESSAGE {
            return Err(Error::Transfer(format!(
                "{}: 종료 표식과 같은 줄은 보낼 수 없음",
                self.name
            )));
        }
        self.session.send_message(line)?;
        self.lines_sent += 1;
        Ok(())
    }

    /// 종료 표식을 보내고 세션을 닫음
    ///
    /// 디스패처에서의 정리는 유예 시간 뒤 (피어의 마지막 HELLO 재전송에 응답하기 위함)
    pub fn finish(self) -> Result<SessionStatsSnapshot> {
        self.session.send_message(CLOSE_MESSAGE)?;
        self.session.close();
        self.session.request_clear()?;

        let stats = self.session.stats();
        info!(
            "{} sent ({} lines) | {}",
            self.name,
            self.lines_sent,
            stats.summary()
        );
        Ok(stats)
    }
}

fn open_with_random_id(dispatcher: &Arc<Dispatcher>, host: &str, port: u16) -> Result<Arc<Session>> {
    let mut rng = rand::thread_rng();
    loop {
        let id: SessionId = rng.gen_range(0..SessionId::MAX);
        match Session::open(dispatcher, host, port, id) {
            Err(Error::SessionIdInUse { .. }) => continue,
            other => return other,
        }
    }
}

enum Phase {
    AwaitingHeader,
    Receiving(BufWriter<File>),
    Completed,
}

struct ReceiveState {
    phase: Phase,
    output: Option<PathBuf>,
    lines: u64,
    failure: Option<String>,
}

/// 파일 수신자 (세션의 상위 핸들러)
///
/// 세션은 핸들러를 약하게만 참조하므로 호출자가 `Arc` 를 들고 있어야 한다.
pub struct FileReceiver {
    out_dir: PathBuf,
    state: Mutex<ReceiveState>,
    completed: Condvar,
    session: Mutex<Option<Arc<Session>>>,
}

impl FileReceiver {
    pub fn new(out_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            out_dir: out_dir.into(),
            state: Mutex::new(ReceiveState {
                phase: Phase::AwaitingHeader,
                output: None,
                lines: 0,
                failure: None,
            }),
            completed: Condvar::new(),
            session: Mutex::new(None),
        })
    }

    /// 수락된 연결에 수신자를 붙임
    pub fn accept(
        dispatcher: &Arc<Dispatcher>,
        params: &ConnectionParameters,
        out_dir: impl Into<PathBuf>,
    ) -> Result<Arc<Self>> {
        let receiver = Self::new(out_dir);
        let session = Session::accept(dispatcher, params, &receiver)?;
        *receiver.session.lock() = Some(session);
        Ok(receiver)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Completed)
    }

    /// 기록 중이거나 기록을 마친 파일 경로
    pub fn output_path(&self) -> Option<PathBuf> {
        self.state.lock().output.clone()
    }

    pub fn lines_received(&self) -> u64 {
        self.state.lock().lines
    }

    /// 종료 표식을 받을 때까지 블록한 뒤 세션을 닫는다
    pub fn wait_completed(&self) -> Result<PathBuf> {
        {
            let mut state = self.state.lock();
            while !matches!(state.phase, Phase::Completed) {
                self.completed.wait(&mut state);
            }
        }
        self.finish()
    }

    /// 시간 제한이 있는 wait_completed. 시간 내에 끝나지 않으면 None
    pub fn wait_completed_timeout(&self, timeout: Duration) -> Result<Option<PathBuf>> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.state.lock();
            while !matches!(state.phase, Phase::Completed) {
                if self.completed.wait_until(&mut state, deadline).timed_out()
                    && !matches!(state.phase, Phase::Completed)
                {
                    return Ok(None);
                }
            }
        }
        self.finish().map(Some)
    }

    fn finish(&self) -> Result<PathBuf> {
        if let Some(session) = self.session.lock().as_ref() {
            session.close();
        }

        let state = self.state.lock();
        if let Some(failure) = &state.failure {
            return Err(Error::Transfer(failure.clone()));
        }
        state
            .output
            .clone()
            .ok_or_else(|| Error::Transfer("헤더 없이 전송 종료".into()))
    }

    fn start_file(&self, state: &mut ReceiveState, name: &str) {
        let Some(base) = Path::new(name).file_name() else {
            state.failure = Some(format!("잘못된 파일 이름: {name:?}"));
            return;
        };
        let path = self
            .out_dir
            .join(format!("{RECEIVED_PREFIX}{}", base.to_string_lossy()));

        match File::create(&path) {
            Ok(file) => {
                info!("receiving {} into {}", name, path.display());
                state.phase = Phase::Receiving(BufWriter::new(file));
                state.output = Some(path);
            }
            Err(e) => {
                warn!("파일 생성 실패 ({}): {}", path.display(), e);
                state.failure = Some(format!("{}: {}", path.display(), e));
            }
        }
    }

    fn complete(&self, state: &mut ReceiveState) {
        if let Phase::Receiving(mut writer) = mem::replace(&mut state.phase, Phase::Completed) {
            if let Err(e) = writer.flush() {
                warn!("파일 flush 실패: {}", e);
                state.failure.get_or_insert_with(|| e.to_string());
            }
        }
        self.completed.notify_all();
    }
}

impl MessageHandler for FileReceiver {
    fn on_message(&self, session: &Session, payload: &str, source: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if payload == CLOSE_MESSAGE {
            self.complete(state);
            info!(
                "transfer from {} complete ({} lines) | {}",
                source,
                state.lines,
                session.stats().summary()
            );
            drop(guard);

            if let Err(e) = session.request_clear() {
                warn!("세션 {} 정리 예약 실패: {}", session.local_id(), e);
            }
            return;
        }

        if state.failure.is_some() {
            return;
        }

        match &mut state.phase {
            Phase::AwaitingHeader => match payload.strip_prefix(SEND_PREFIX) {
                Some(name) if !name.is_empty() => self.start_file(state, name),
                _ => debug!("헤더 전 메시지 버림 from {}: {:?}", source, payload),
            },
            Phase::Receiving(writer) => {
                let written = writer
                    .write_all(payload.as_bytes())
                    .and_then(|_| writer.write_all(b"\n"));
                match written {
                    Ok(()) => state.lines += 1,
                    Err(e) => {
                        warn!("파일 쓰기 실패: {}", e);
                        state.failure = Some(e.to_string());
                    }
                }
            }
            Phase::Completed => debug!("완료 후 메시지 무시 from {}: {:?}", source, payload),
        }
    }
}
