//! Run configuration.
//!
//! One immutable [`Config`] is built from the command line at startup and
//! handed to the session at open time; nothing is reloaded mid-session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// File whose trimmed contents are the backend access token.
    pub credentials: PathBuf,
    /// Cloud project owning the recognizer.
    pub project_id: String,
    /// WebSocket endpoint of the streaming recognition backend.
    pub endpoint: String,
    /// Capture sample rate in Hz (mono, 16-bit).
    pub sample_rate: u32,
    /// Index of the input device on the default audio host.
    pub device_index: usize,
    /// Result poll rate of the relay loop, in Hz.
    pub refresh_hz: u32,
    /// Destination for outbound OSC datagrams.
    pub osc_target: SocketAddr,
    /// Local port for inbound OSC control messages.
    pub osc_in_port: u16,
    /// Language codes requested from the recognizer.
    pub languages: Vec<String>,
}

impl Config {
    /// Recognizer resource path sent in the streaming handshake.
    pub fn recognizer(&self) -> String {
        format!("projects/{}/locations/global/recognizers/_", self.project_id)
    }

    /// Period of the result poll loop.
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(u64::from((1000 / self.refresh_hz.max(1)).max(1)))
    }

    /// Read the backend access token from the credentials file.
    pub fn load_token(&self) -> Result<String> {
        let raw = std::fs::read_to_string(&self.credentials)?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(Error::Credentials(format!(
                "credentials file {} is empty",
                self.credentials.display()
            )));
        }
        Ok(token.to_string())
    }
}
