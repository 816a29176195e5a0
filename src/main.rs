//! Transcription relay service.
//!
//! Captures microphone audio, streams it to a cloud speech recognition
//! backend, and relays assembled sentences to a show controller over
//! OSC. Runs headless until stopped by Ctrl-C or a remote
//! `/transcription/stop` command.

mod audio;
mod config;
mod error;
mod osc;
mod recognition;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::osc::{spawn_stop_listener, ControlBridge};
use crate::recognition::{ResultQueue, Supervisor};

#[derive(Parser)]
#[command(name = "transcription-server", version, about = "Streams microphone audio to a cloud recognizer and relays sentences over OSC")]
struct Cli {
    /// File containing the backend access token
    #[arg(short, long, default_value = "service-account.json")]
    credentials: PathBuf,

    /// Cloud project that owns the recognizer
    #[arg(short, long)]
    project_id: String,

    /// WebSocket endpoint of the streaming recognition backend
    #[arg(short, long)]
    endpoint: String,

    /// Capture sample rate in Hz
    #[arg(short, long, default_value_t = 44_100)]
    sample_rate: u32,

    /// Input device index on the default audio host
    #[arg(short, long, default_value_t = 0)]
    device: usize,

    /// Result relay rate in Hz
    #[arg(short, long, default_value_t = 30)]
    refresh: u32,

    /// Destination port for outbound OSC messages
    #[arg(short, long, default_value_t = 9000)]
    osc_out: u16,

    /// Local port for inbound OSC control messages
    #[arg(short = 'i', long, default_value_t = 9001)]
    osc_in: u16,

    /// Destination address for outbound OSC messages
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Recognition language code; repeat for multiple languages
    #[arg(short, long = "language", default_value = "en-us")]
    language: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            credentials: self.credentials,
            project_id: self.project_id,
            endpoint: self.endpoint,
            sample_rate: self.sample_rate,
            device_index: self.device,
            refresh_hz: self.refresh,
            osc_target: SocketAddr::new(self.ip, self.osc_out),
            osc_in_port: self.osc_in,
            languages: self.language,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Cli::parse().into_config());
    info!(
        "transcription server starting (pid: {}, relay to {})",
        std::process::id(),
        config.osc_target
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("transcription server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("transcription server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Arc<Config>) -> Result<()> {
    let token = config.load_token()?;
    let queue = ResultQueue::new();
    let supervisor = Supervisor::new(Arc::clone(&config), token, queue.clone());
    let handle = supervisor.handle();

    let mut bridge = ControlBridge::new(config.osc_target)?;
    let control_socket =
        tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.osc_in_port)).await?;

    let active = supervisor.start().await?;

    if let Err(e) = bridge.announce_started() {
        warn!("[Main] start announcement not sent: {e}");
    }
    let running = Arc::new(AtomicBool::new(true));
    let heartbeat = bridge.spawn_heartbeat(Arc::clone(&running))?;
    let stop_listener = spawn_stop_listener(control_socket, handle.clone());

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[Main] interrupt received");
            if let Err(e) = signal_handle.request_stop() {
                warn!("[Main] interrupt ignored: {e}");
            }
        }
    });

    let session_task = tokio::spawn(active.run());
    let period = config.poll_period();
    let outcome = loop {
        drain(&queue, &mut bridge);
        if session_task.is_finished() {
            break session_task.await;
        }
        tokio::time::sleep(period).await;
    };

    // Late results queued between the last tick and session end.
    drain(&queue, &mut bridge);

    running.store(false, Ordering::Release);
    heartbeat.abort();
    // A keepalive send may still be in flight; the stopped announcement
    // must not go out until the task has actually finished.
    let _ = heartbeat.await;
    stop_listener.abort();
    if let Err(e) = bridge.announce_stopped() {
        warn!("[Main] stop announcement not sent: {e}");
    }

    match outcome {
        Ok(result) => result,
        Err(e) => Err(Error::Task(e.to_string())),
    }
}

fn drain(queue: &ResultQueue, bridge: &mut ControlBridge) {
    while let Some(sentence) = queue.try_pop() {
        if let Err(e) = bridge.relay(&sentence) {
            warn!("[Main] sentence not relayed: {e}");
        }
    }
}
