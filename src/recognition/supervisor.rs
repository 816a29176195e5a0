//! Session lifecycle: start, timed renewal, stop.
//!
//! The backend enforces a hard per-call duration limit, so a long
//! transcription session spans many streaming calls. The supervisor
//! renews the call well before the limit and the [`FrameRouter`] buffers
//! audio captured during the swap, so no audio is lost and frames reach
//! the backend in capture order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::audio::{AudioSource, FrameSink};
use crate::config::Config;
use crate::error::{Error, Result};

use super::queue::ResultQueue;
use super::sentence::SentenceAssembler;
use super::session::{AudioSender, RecognitionSession};

/// Streaming calls are renewed once they have been open this long. The
/// backend cuts calls off at ten minutes; the margin absorbs the
/// replacement handshake.
pub const RENEW_AFTER: Duration = Duration::from_secs(540);

/// Loop wake period when no result is pending, and the poll grain for
/// the renewal clock.
const IDLE_TICK: Duration = Duration::from_millis(250);

/// How long to wait for the backend to flush and close after
/// end-of-input before giving up on the drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Restarting => "restarting",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct RouterInner {
    state: SessionState,
    sender: Option<AudioSender>,
    catchup: Vec<Vec<u8>>,
}

/// Single point of truth for where a captured frame goes.
///
/// The capture callback and the supervisor task contend on one mutex, so
/// a frame delivered during a sender swap lands either in the catchup
/// buffer or on the new sender after the merged catchup, never between.
pub struct FrameRouter {
    inner: Mutex<RouterInner>,
}

impl FrameRouter {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                state: SessionState::Idle,
                sender: None,
                catchup: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        self.inner.lock().expect("frame router mutex poisoned")
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Route one captured frame according to the current state. Called
    /// from the capture thread.
    pub fn deliver(&self, frame: Vec<u8>) {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Running => {
                if let Some(sender) = &inner.sender {
                    if let Err(e) = sender.send(frame) {
                        warn!("[Router] frame not delivered: {e}");
                    }
                }
            }
            SessionState::Starting | SessionState::Restarting => inner.catchup.push(frame),
            SessionState::Idle | SessionState::Stopping => {}
        }
    }

    fn begin_start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != SessionState::Idle {
            return Err(Error::IllegalState(format!(
                "cannot start a session while {}",
                inner.state
            )));
        }
        inner.state = SessionState::Starting;
        Ok(())
    }

    /// Install a live sender. Audio buffered since the last swap goes
    /// out first, merged into one frame in capture order.
    fn resume(&self, sender: AudioSender) {
        let mut inner = self.lock();
        let catchup = std::mem::take(&mut inner.catchup);
        if !catchup.is_empty() {
            if let Err(e) = sender.send(merge_frames(catchup)) {
                warn!("[Router] catchup audio not delivered: {e}");
            }
        }
        inner.sender = Some(sender);
        inner.state = SessionState::Running;
    }

    /// Take the live sender out of service for renewal; dropping it is
    /// the end-of-input signal for the old call.
    fn begin_restart(&self) -> Option<AudioSender> {
        let mut inner = self.lock();
        inner.state = SessionState::Restarting;
        inner.sender.take()
    }

    fn begin_stop(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Stopping;
        inner.sender = None;
    }

    fn reset_idle(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Idle;
        inner.sender = None;
        inner.catchup.clear();
    }
}

fn merge_frames(frames: Vec<Vec<u8>>) -> Vec<u8> {
    let total = frames.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    for frame in frames {
        merged.extend_from_slice(&frame);
    }
    merged
}

/// Remote control surface of a running supervisor. Cloneable across
/// tasks (stop listener, Ctrl-C handler).
#[derive(Clone)]
pub struct SupervisorHandle {
    router: Arc<FrameRouter>,
    stop_requested: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl SupervisorHandle {
    /// Flag the session to stop. Effective exactly once: a repeat
    /// request, or a request while no session is active, is rejected
    /// synchronously without touching the session.
    pub fn request_stop(&self) -> Result<()> {
        let state = self.router.state();
        if !matches!(
            state,
            SessionState::Starting | SessionState::Running | SessionState::Restarting
        ) {
            return Err(Error::IllegalState(format!("cannot stop while {state}")));
        }
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalState("stop already requested".into()));
        }
        self.stop_notify.notify_one();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn test_active() -> Self {
        let router = Arc::new(FrameRouter::new());
        router.begin_start().expect("fresh router can start");
        Self {
            router,
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn stop_was_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Owns the pieces of one transcription session before it starts.
pub struct Supervisor {
    config: Arc<Config>,
    token: String,
    router: Arc<FrameRouter>,
    queue: ResultQueue,
    stop_requested: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, token: String, queue: ResultQueue) -> Self {
        Self {
            config,
            token,
            router: Arc::new(FrameRouter::new()),
            queue,
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            router: Arc::clone(&self.router),
            stop_requested: Arc::clone(&self.stop_requested),
            stop_notify: Arc::clone(&self.stop_notify),
        }
    }

    /// Bring the session up: capture first, so early audio lands in the
    /// catchup buffer while the handshake is in flight. Any resource
    /// failure tears back down to idle and propagates.
    pub async fn start(self) -> Result<ActiveSession> {
        self.router.begin_start()?;

        let sink_router = Arc::clone(&self.router);
        let sink: FrameSink = Arc::new(move |frame| sink_router.deliver(frame));
        let audio = match AudioSource::start(&self.config, sink) {
            Ok(audio) => audio,
            Err(e) => {
                self.router.reset_idle();
                return Err(e);
            }
        };

        let (session, sender) = match RecognitionSession::open(&self.config, &self.token).await {
            Ok(opened) => opened,
            Err(e) => {
                let mut audio = audio;
                audio.stop();
                self.router.reset_idle();
                return Err(e);
            }
        };
        self.router.resume(sender);
        info!("[Supervisor] session running");

        Ok(ActiveSession {
            epoch: Instant::now(),
            stream_began: Duration::ZERO,
            assembler: SentenceAssembler::new(),
            supervisor: self,
            audio,
            session,
        })
    }
}

/// A started session, consuming backend results until stopped or failed.
pub struct ActiveSession {
    supervisor: Supervisor,
    audio: AudioSource,
    session: RecognitionSession,
    /// Session clock origin; sentence times are measured from it.
    epoch: Instant,
    /// Elapsed time at which the current streaming call opened.
    stream_began: Duration,
    assembler: SentenceAssembler,
}

impl ActiveSession {
    /// Consume results until the session stops. Stream faults and
    /// unexpected ends while running trigger a renewal; a failed renewal
    /// handshake is fatal. Returns once a requested stop has drained the
    /// final results.
    pub async fn run(mut self) -> Result<()> {
        let mut stopping = false;
        let mut drain_deadline = None;
        loop {
            if !stopping && self.supervisor.stop_requested.load(Ordering::Acquire) {
                stopping = true;
                drain_deadline = Some(Instant::now() + DRAIN_TIMEOUT);
                info!("[Supervisor] stop requested, halting capture and draining");
                self.audio.stop();
                self.supervisor.router.begin_stop();
            }
            if let Some(deadline) = drain_deadline {
                if Instant::now() >= deadline {
                    warn!("[Supervisor] backend did not close within the drain window");
                    break;
                }
            }

            tokio::select! {
                batch = self.session.next_batch() => match batch {
                    Ok(Some(batch)) => {
                        let now = self.epoch.elapsed();
                        match self.assembler.handle_batch(batch, now, self.stream_began) {
                            Ok(Some(sentence)) => self.supervisor.queue.push(sentence),
                            Ok(None) => {}
                            Err(e) => warn!("[Supervisor] dropped result: {e}"),
                        }
                    }
                    Ok(None) if stopping => break,
                    Ok(None) => {
                        warn!("[Supervisor] stream ended unexpectedly, renewing");
                        self.renew().await?;
                    }
                    Err(e) if stopping => {
                        warn!("[Supervisor] fault while draining: {e}");
                        break;
                    }
                    Err(e) => {
                        warn!("[Supervisor] stream fault, renewing: {e}");
                        self.renew().await?;
                    }
                },
                _ = self.supervisor.stop_notify.notified(), if !stopping => {}
                _ = tokio::time::sleep(IDLE_TICK) => {}
            }

            if !stopping && self.epoch.elapsed().saturating_sub(self.stream_began) >= RENEW_AFTER {
                self.renew().await?;
            }
        }

        self.supervisor.router.reset_idle();
        info!("[Supervisor] session stopped");
        Ok(())
    }

    /// Swap the streaming call. Audio captured while the replacement
    /// handshake is in flight is buffered and delivered first on the new
    /// call.
    async fn renew(&mut self) -> Result<()> {
        info!("[Supervisor] renewing streaming call");
        drop(self.supervisor.router.begin_restart());

        let (session, sender) =
            match RecognitionSession::open(&self.supervisor.config, &self.supervisor.token).await {
                Ok(opened) => opened,
                Err(e) => {
                    self.audio.stop();
                    self.supervisor.router.reset_idle();
                    return Err(e);
                }
            };
        self.session = session;
        self.supervisor.router.resume(sender);
        self.stream_began = self.epoch.elapsed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn no_frame_lost_across_a_renewal() {
        let router = FrameRouter::new();
        router.begin_start().unwrap();
        router.deliver(vec![1]);
        router.deliver(vec![2]);

        let (first_sender, mut first_rx) = AudioSender::test_pair();
        router.resume(first_sender);
        router.deliver(vec![3]);

        drop(router.begin_restart());
        router.deliver(vec![4]);
        router.deliver(vec![5]);

        let (second_sender, mut second_rx) = AudioSender::test_pair();
        router.resume(second_sender);
        router.deliver(vec![6]);

        // Early audio is merged ahead of the first live frame on each call.
        assert_eq!(drain(&mut first_rx), [vec![1, 2], vec![3]]);
        assert_eq!(drain(&mut second_rx), [vec![4, 5], vec![6]]);
    }

    #[test]
    fn catchup_buffer_is_drained_exactly_once() {
        let router = FrameRouter::new();
        router.begin_start().unwrap();
        router.deliver(vec![1]);

        let (first_sender, mut first_rx) = AudioSender::test_pair();
        router.resume(first_sender);
        assert_eq!(drain(&mut first_rx), [vec![1]]);

        drop(router.begin_restart());
        let (second_sender, mut second_rx) = AudioSender::test_pair();
        router.resume(second_sender);
        assert!(drain(&mut second_rx).is_empty());
    }

    #[test]
    fn frames_are_dropped_while_idle_and_stopping() {
        let router = FrameRouter::new();
        router.deliver(vec![1]);
        router.begin_start().unwrap();

        let (sender, mut rx) = AudioSender::test_pair();
        router.resume(sender);
        assert!(drain(&mut rx).is_empty());

        router.begin_stop();
        router.deliver(vec![2]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn start_is_rejected_unless_idle() {
        let router = FrameRouter::new();
        router.begin_start().unwrap();
        assert!(matches!(
            router.begin_start(),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn stop_request_is_effective_exactly_once() {
        let handle = SupervisorHandle::test_active();
        handle.request_stop().unwrap();
        assert!(matches!(
            handle.request_stop(),
            Err(Error::IllegalState(_))
        ));
        assert!(handle.stop_was_requested());
    }

    #[test]
    fn stop_request_while_idle_is_rejected() {
        let handle = SupervisorHandle {
            router: Arc::new(FrameRouter::new()),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        };
        assert!(matches!(
            handle.request_stop(),
            Err(Error::IllegalState(_))
        ));
        assert!(!handle.stop_was_requested());
    }

    #[test]
    fn renewal_margin_stays_under_the_backend_limit() {
        assert!(RENEW_AFTER < Duration::from_secs(600));
    }
}
