//! Microphone capture.
//!
//! Wraps one cpal input stream and delivers each filled buffer to a
//! registered sink as raw 16-bit little-endian PCM. The cpal stream is
//! not `Send`, so it lives on a dedicated capture thread owned by
//! [`AudioSource`]; the thread parks until stop is requested.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};

/// Receives each filled capture buffer as 16-bit little-endian PCM bytes.
pub type FrameSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

pub struct AudioSource {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSource {
    /// Begin continuous mono capture on the configured input device and
    /// sample rate. Blocks until the stream is playing; a device or
    /// stream failure here is fatal to session start.
    pub fn start(config: &Config, sink: FrameSink) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let device_index = config.device_index;
        let sample_rate = config.sample_rate;

        let thread = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(device_index, sample_rate, sink) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until the stop sender is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("[Audio] capture stream closed");
            })
            .map_err(|e| Error::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio(
                "capture thread exited before reporting readiness".into(),
            )),
        }
    }

    /// Halt capture and release the input device. Safe to call more than
    /// once; also runs on drop.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            drop(stop_tx);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
            info!("[Audio] capture stopped");
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(
    device_index: usize,
    sample_rate: u32,
    sink: FrameSink,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .input_devices()
        .map_err(|e| Error::Audio(format!("failed to enumerate input devices: {e}")))?
        .nth(device_index)
        .ok_or(Error::DeviceNotFound(device_index))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(sample_rate),
        buffer_size: BufferSize::Default,
    };

    // Prefer native i16 capture; otherwise take f32 and convert.
    let native_i16 = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(format!("failed to query input formats: {e}")))?
        .any(|c| c.sample_format() == SampleFormat::I16);

    let stream = if native_i16 {
        device.build_input_stream(
            &config,
            move |data: &[i16], _| sink(i16_to_pcm_bytes(data)),
            log_stream_error,
            None,
        )
    } else {
        device.build_input_stream(
            &config,
            move |data: &[f32], _| sink(f32_to_pcm_bytes(data)),
            log_stream_error,
            None,
        )
    }
    .map_err(|e| Error::Audio(format!("failed to open input stream on '{name}': {e}")))?;

    stream
        .play()
        .map_err(|e| Error::Audio(format!("failed to start capture on '{name}': {e}")))?;

    info!("[Audio] capturing from '{name}' at {sample_rate} Hz");
    Ok(stream)
}

fn log_stream_error(err: cpal::StreamError) {
    error!("[Audio] stream error: {err}");
}

fn i16_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

fn f32_to_pcm_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let quantized = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_frames_are_little_endian() {
        assert_eq!(i16_to_pcm_bytes(&[0x0102, -2]), vec![0x02, 0x01, 0xfe, 0xff]);
    }

    #[test]
    fn f32_frames_quantize_and_clamp() {
        let bytes = f32_to_pcm_bytes(&[0.0, 1.0, -1.5]);
        assert_eq!(&bytes[0..2], &0i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &32767i16.to_le_bytes());
        assert_eq!(&bytes[4..6], &(-32768i16).to_le_bytes());
    }
}
