//! OSC bridge to the show controller.
//!
//! Outbound: fire-and-forget UDP datagrams announcing session lifecycle,
//! per-sentence progress, and a keepalive heartbeat the controller uses
//! to judge liveness. Inbound: a listener that translates the remote
//! `/transcription/stop` command into a supervisor stop request. There
//! are no acknowledgements and no retries on this path.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::recognition::sentence::{Sentence, SentenceId};
use crate::recognition::SupervisorHandle;

const ADDR_STARTED: &str = "/transcription/started";
const ADDR_STOPPED: &str = "/transcription/stopped";
const ADDR_KEEPALIVE: &str = "/transcription/keepalive";
const ADDR_ELABORATING: &str = "/transcription/elaborating";
const ADDR_FINALIZED: &str = "/transcription/finalized";
const ADDR_STOP_COMMAND: &str = "/transcription/stop";

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Remembers which sentence identities have been announced, so
/// `started/{id}` goes out exactly once and always first.
#[derive(Default)]
struct SentenceTracker {
    announced: HashSet<SentenceId>,
}

impl SentenceTracker {
    fn first_sighting(&mut self, id: SentenceId) -> bool {
        self.announced.insert(id)
    }
}

pub struct ControlBridge {
    socket: UdpSocket,
    target: SocketAddr,
    tracker: SentenceTracker,
}

impl ControlBridge {
    pub fn new(target: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        Ok(Self {
            socket,
            target,
            tracker: SentenceTracker::default(),
        })
    }

    pub fn announce_started(&self) -> Result<()> {
        info!("[OSC] announcing session start to {}", self.target);
        send_message(&self.socket, self.target, ADDR_STARTED, vec![])
    }

    pub fn announce_stopped(&self) -> Result<()> {
        info!("[OSC] announcing session stop to {}", self.target);
        send_message(&self.socket, self.target, ADDR_STOPPED, vec![])
    }

    /// Dispatch one dequeued sentence. An identity seen for the first
    /// time is announced with `started/{id}` before its content message.
    pub fn relay(&mut self, sentence: &Sentence) -> Result<()> {
        let id = sentence.id();
        if self.tracker.first_sighting(id) {
            send_message(
                &self.socket,
                self.target,
                &format!("{ADDR_STARTED}/{id}"),
                vec![OscType::Float(duration_ms(sentence.start()))],
            )?;
        }
        match sentence {
            Sentence::Elaborating(s) => send_message(
                &self.socket,
                self.target,
                &format!("{ADDR_ELABORATING}/{id}"),
                vec![
                    OscType::String(s.stable_text()),
                    OscType::String(s.unstable_text()),
                    OscType::Float(duration_ms(s.start)),
                ],
            ),
            Sentence::Finalized(s) => send_message(
                &self.socket,
                self.target,
                &format!("{ADDR_FINALIZED}/{id}"),
                vec![
                    OscType::String(s.full_text()),
                    OscType::Float(duration_ms(s.start)),
                    OscType::Float(duration_ms(s.end)),
                ],
            ),
        }
    }

    /// Emit `keepalive` every second until `active` clears. The caller
    /// aborts the task before the terminal `stopped` announcement so no
    /// keepalive follows it.
    pub fn spawn_heartbeat(&self, active: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let socket = self.socket.try_clone()?;
        let target = self.target;
        Ok(tokio::spawn(async move {
            let mut beat = tokio::time::interval(HEARTBEAT_PERIOD);
            // The first interval tick fires immediately; the heartbeat
            // cadence starts one period after session start.
            beat.tick().await;
            loop {
                beat.tick().await;
                if !active.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = send_message(&socket, target, ADDR_KEEPALIVE, vec![]) {
                    warn!("[OSC] keepalive not sent: {e}");
                }
            }
        }))
    }
}

fn send_message(
    socket: &UdpSocket,
    target: SocketAddr,
    addr: &str,
    args: Vec<OscType>,
) -> Result<()> {
    let packet = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    let bytes = rosc::encoder::encode(&packet).map_err(|e| Error::Osc(format!("{e:?}")))?;
    socket.send_to(&bytes, target)?;
    Ok(())
}

fn duration_ms(d: Duration) -> f32 {
    (d.as_secs_f64() * 1000.0) as f32
}

/// Listen for inbound control datagrams. `/transcription/stop` requests
/// a stop on the supervisor; anything else is logged and ignored. Runs
/// until aborted.
pub fn spawn_stop_listener(
    socket: tokio::net::UdpSocket,
    handle: SupervisorHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; rosc::decoder::MTU];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("[OSC] control socket receive failed: {e}");
                    continue;
                }
            };
            match rosc::decoder::decode_udp(&buf[..len]) {
                Ok((_, OscPacket::Message(message))) => {
                    if message.addr == ADDR_STOP_COMMAND {
                        info!("[OSC] stop command from {peer}");
                        if let Err(e) = handle.request_stop() {
                            warn!("[OSC] stop command ignored: {e}");
                        }
                    } else {
                        warn!("[OSC] unrecognized control address {}", message.addr);
                    }
                }
                Ok((_, OscPacket::Bundle(_))) => {
                    debug!("[OSC] ignoring control bundle from {peer}");
                }
                Err(e) => warn!("[OSC] undecodable control datagram from {peer}: {e:?}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::sentence::{
        ElaboratingSentence, FinalizedSentence, SentenceElement, Word,
    };

    fn listener() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn recv_message(socket: &UdpSocket) -> OscMessage {
        let mut buf = [0u8; rosc::decoder::MTU];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        match rosc::decoder::decode_udp(&buf[..len]).unwrap().1 {
            OscPacket::Message(message) => message,
            OscPacket::Bundle(_) => panic!("expected a message"),
        }
    }

    fn elaborating(id: SentenceId) -> Sentence {
        Sentence::Elaborating(ElaboratingSentence {
            id,
            start: Duration::from_millis(1500),
            elements: vec![
                SentenceElement {
                    text: "hello ".into(),
                    is_stable: true,
                },
                SentenceElement {
                    text: "wor".into(),
                    is_stable: false,
                },
            ],
        })
    }

    #[test]
    fn first_sighting_announces_started_before_content() {
        let (receiver, target) = listener();
        let mut bridge = ControlBridge::new(target).unwrap();
        let id = SentenceId::mint();

        bridge.relay(&elaborating(id)).unwrap();

        let started = recv_message(&receiver);
        assert_eq!(started.addr, format!("/transcription/started/{id}"));
        assert_eq!(started.args, vec![OscType::Float(1500.0)]);

        let content = recv_message(&receiver);
        assert_eq!(content.addr, format!("/transcription/elaborating/{id}"));
        assert_eq!(
            content.args,
            vec![
                OscType::String("hello ".into()),
                OscType::String("wor".into()),
                OscType::Float(1500.0),
            ]
        );
    }

    #[test]
    fn started_is_announced_once_per_identity() {
        let (receiver, target) = listener();
        let mut bridge = ControlBridge::new(target).unwrap();
        let id = SentenceId::mint();

        bridge.relay(&elaborating(id)).unwrap();
        bridge.relay(&elaborating(id)).unwrap();

        let addrs: Vec<String> = (0..3).map(|_| recv_message(&receiver).addr).collect();
        assert_eq!(
            addrs,
            [
                format!("/transcription/started/{id}"),
                format!("/transcription/elaborating/{id}"),
                format!("/transcription/elaborating/{id}"),
            ]
        );
    }

    #[test]
    fn finalized_carries_full_text_and_both_times() {
        let (receiver, target) = listener();
        let mut bridge = ControlBridge::new(target).unwrap();
        let id = SentenceId::mint();

        bridge.relay(&elaborating(id)).unwrap();
        recv_message(&receiver);
        recv_message(&receiver);

        bridge
            .relay(&Sentence::Finalized(FinalizedSentence {
                id,
                start: Duration::from_millis(1500),
                end: Duration::from_millis(3250),
                words: vec![
                    Word {
                        start: Duration::from_millis(1500),
                        end: Duration::from_millis(2000),
                        text: "hello".into(),
                    },
                    Word {
                        start: Duration::from_millis(2100),
                        end: Duration::from_millis(2700),
                        text: "world".into(),
                    },
                ],
                confidence: 0.9,
            }))
            .unwrap();

        let finalized = recv_message(&receiver);
        assert_eq!(finalized.addr, format!("/transcription/finalized/{id}"));
        assert_eq!(
            finalized.args,
            vec![
                OscType::String("hello world".into()),
                OscType::Float(1500.0),
                OscType::Float(3250.0),
            ]
        );
    }

    #[tokio::test]
    async fn stop_command_reaches_the_supervisor() {
        let socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = SupervisorHandle::test_active();
        let listener = spawn_stop_listener(socket, handle.clone());

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let unrecognized = rosc::encoder::encode(&OscPacket::Message(OscMessage {
            addr: "/transcription/mystery".into(),
            args: vec![],
        }))
        .unwrap();
        sender.send_to(&unrecognized, addr).unwrap();

        let stop = rosc::encoder::encode(&OscPacket::Message(OscMessage {
            addr: ADDR_STOP_COMMAND.into(),
            args: vec![],
        }))
        .unwrap();
        sender.send_to(&stop, addr).unwrap();

        for _ in 0..50 {
            if handle.stop_was_requested() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.stop_was_requested());
        listener.abort();
    }

    fn drain_addrs(socket: &UdpSocket) -> Vec<String> {
        let mut buf = [0u8; rosc::decoder::MTU];
        let mut addrs = Vec::new();
        while let Ok((len, _)) = socket.recv_from(&mut buf) {
            match rosc::decoder::decode_udp(&buf[..len]).unwrap().1 {
                OscPacket::Message(message) => addrs.push(message.addr),
                OscPacket::Bundle(_) => panic!("expected a message"),
            }
        }
        addrs
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_one_second_cadence() {
        let (receiver, target) = listener();
        receiver.set_nonblocking(true).unwrap();
        let bridge = ControlBridge::new(target).unwrap();
        let active = Arc::new(AtomicBool::new(true));
        let heartbeat = bridge.spawn_heartbeat(Arc::clone(&active)).unwrap();

        // Paused-clock ticks at 1 s through 5 s land before this sleep
        // returns.
        tokio::time::sleep(Duration::from_millis(5500)).await;
        active.store(false, Ordering::Release);
        heartbeat.abort();
        let _ = heartbeat.await;

        let addrs = drain_addrs(&receiver);
        assert_eq!(addrs.len(), 5);
        assert!(addrs.iter().all(|a| a == ADDR_KEEPALIVE));
    }

    #[tokio::test(start_paused = true)]
    async fn no_keepalive_follows_heartbeat_shutdown() {
        let (receiver, target) = listener();
        receiver.set_nonblocking(true).unwrap();
        let bridge = ControlBridge::new(target).unwrap();
        let active = Arc::new(AtomicBool::new(true));
        let heartbeat = bridge.spawn_heartbeat(Arc::clone(&active)).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        active.store(false, Ordering::Release);
        heartbeat.abort();
        // Once the cancelled task has resolved, no send can still be in
        // flight; everything received from here on predates shutdown.
        let _ = heartbeat.await;
        drain_addrs(&receiver);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(drain_addrs(&receiver).is_empty());
    }
}
