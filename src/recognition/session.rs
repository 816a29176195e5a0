//! One streaming recognition call against the backend.
//!
//! The backend speaks WebSocket: a JSON configuration handshake, binary
//! 16-bit PCM frames upstream, JSON result messages downstream, and a
//! JSON end-of-stream control text that asks the backend to flush and
//! close. Each [`RecognitionSession`] covers exactly one call; the
//! supervisor opens a replacement before the backend's hard duration
//! limit is reached.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control text that asks the backend to flush pending results and close.
const END_OF_STREAM: &str = r#"{"type":"end_of_stream"}"#;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamingConfigRequest<'a> {
    recognizer: String,
    streaming_config: StreamingConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamingConfig<'a> {
    config: RecognitionConfig<'a>,
    streaming_features: StreamingFeatures,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'static str,
    sample_rate_hertz: u32,
    audio_channel_count: u16,
    language_codes: &'a [String],
    model: &'static str,
    features: RecognitionFeatures,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionFeatures {
    enable_word_time_offsets: bool,
    enable_word_confidence: bool,
    enable_automatic_punctuation: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamingFeatures {
    interim_results: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingResponse {
    #[serde(default)]
    results: Vec<StreamingResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingResult {
    #[serde(default)]
    alternatives: Vec<RawAlternative>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    stability: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    words: Vec<RawWord>,
}

/// One word as the backend reports it, with offsets in seconds relative
/// to the beginning of the streaming call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWord {
    #[serde(default)]
    pub word: String,
    #[serde(default)]
    pub start_offset: Option<f64>,
    #[serde(default)]
    pub end_offset: Option<f64>,
}

/// One in-progress span: the best alternative of a non-final sub-result.
#[derive(Debug)]
pub struct InterimElement {
    pub transcript: String,
    pub stability: f32,
}

/// The best alternative of a final result.
#[derive(Debug)]
pub struct FinalAlternative {
    pub confidence: f32,
    pub words: Vec<RawWord>,
}

/// One decoded backend message, classified for assembly.
#[derive(Debug)]
pub enum ResultBatch {
    Interim(Vec<InterimElement>),
    Final(FinalAlternative),
}

impl StreamingResponse {
    /// Classify a response. A final sub-result wins the whole batch; a
    /// final with no alternative, or a batch with no usable sub-results,
    /// yields `None` and is dropped by the caller.
    fn into_batch(self) -> Option<ResultBatch> {
        if let Some(finalized) = self.results.iter().position(|r| r.is_final) {
            let mut result = self.results.into_iter().nth(finalized)?;
            if result.alternatives.is_empty() {
                warn!("[Session] final result carried no alternatives, dropping batch");
                return None;
            }
            let best = result.alternatives.swap_remove(0);
            return Some(ResultBatch::Final(FinalAlternative {
                confidence: best.confidence,
                words: best.words,
            }));
        }
        let elements: Vec<InterimElement> = self
            .results
            .into_iter()
            .filter_map(|result| {
                let stability = result.stability;
                result
                    .alternatives
                    .into_iter()
                    .next()
                    .map(|best| InterimElement {
                        transcript: best.transcript,
                        stability,
                    })
            })
            .collect();
        if elements.is_empty() {
            None
        } else {
            Some(ResultBatch::Interim(elements))
        }
    }
}

/// Write side of a streaming call. Cloneable; sends never block.
///
/// Dropping every clone is the end-of-input signal: the forwarder task
/// then tells the backend to flush and close.
#[derive(Clone)]
pub struct AudioSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl AudioSender {
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::StreamClosed)
    }

    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// The read half of one streaming call. The write half lives in a
/// detached forwarder task fed by the [`AudioSender`].
pub struct RecognitionSession {
    read: SplitStream<WsStream>,
}

impl RecognitionSession {
    /// Connect, authenticate, and send the streaming configuration
    /// handshake. Any failure here is a resource acquisition failure.
    pub async fn open(config: &Config, token: &str) -> Result<(Self, AudioSender)> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Handshake(format!("bad endpoint {}: {e}", config.endpoint)))?;
        let bearer = format!("Bearer {token}")
            .parse()
            .map_err(|_| Error::Handshake("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _) = connect_async(request).await?;
        let (mut write, read) = socket.split();

        let handshake = StreamingConfigRequest {
            recognizer: config.recognizer(),
            streaming_config: StreamingConfig {
                config: RecognitionConfig {
                    encoding: "LINEAR16",
                    sample_rate_hertz: config.sample_rate,
                    audio_channel_count: 1,
                    language_codes: &config.languages,
                    model: "long",
                    features: RecognitionFeatures {
                        enable_word_time_offsets: true,
                        enable_word_confidence: true,
                        enable_automatic_punctuation: true,
                    },
                },
                streaming_features: StreamingFeatures {
                    interim_results: true,
                },
            },
        };
        write
            .send(Message::text(serde_json::to_string(&handshake)?))
            .await?;
        debug!("[Session] streaming call opened to {}", config.endpoint);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_audio(write, rx));

        Ok((Self { read }, AudioSender { tx }))
    }

    /// The next decoded batch; `Ok(None)` when the backend has closed
    /// the stream in an orderly way. Empty responses and non-text frames
    /// are skipped.
    pub async fn next_batch(&mut self) -> Result<Option<ResultBatch>> {
        while let Some(message) = self.read.next().await {
            match message? {
                Message::Text(text) => {
                    let response: StreamingResponse = serde_json::from_str(text.as_str())?;
                    if let Some(batch) = response.into_batch() {
                        return Ok(Some(batch));
                    }
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }
}

/// Drains captured frames into the socket; runs until every sender clone
/// is dropped, then asks the backend to flush and close.
async fn forward_audio(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write.send(Message::binary(frame)).await {
            warn!("[Session] audio forwarding halted: {e}");
            return;
        }
    }
    if let Err(e) = write.send(Message::text(END_OF_STREAM)).await {
        warn!("[Session] end-of-stream signal not delivered: {e}");
        return;
    }
    let _ = write.flush().await;
    debug!("[Session] end of input signalled");
}
