//! Playback scheduling for synthesized speech.
//!
//! At most one playback unit is active at a time. The output stream pulls
//! from a sample queue; the session loop polls for natural completion,
//! fires the watchdog when a unit overstays its estimated duration, and
//! cancels everything on barge-in.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Host, Stream, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ClientError;
use crate::net::PlaybackUnit;

use super::{CHANNELS, PLAYBACK_SAMPLE_RATE};

/// Extra time past the estimated unit duration before the watchdog fires
const WATCHDOG_SLACK: Duration = Duration::from_secs(2);

/// Result of polling the active unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPoll {
    Idle,
    Playing,
    /// Queue drained on its own
    Completed,
    /// Watchdog deadline passed with samples still queued
    TimedOut,
}

pub struct PlaybackScheduler {
    host: Host,
    stream: Arc<Mutex<Option<Stream>>>,
    queue: Arc<Mutex<VecDeque<f32>>>,
    is_speaking: Arc<AtomicBool>,
    deadline: Arc<Mutex<Option<Instant>>>,
    selected_device: Arc<Mutex<Option<String>>>,
    units_played: Arc<Mutex<u64>>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            stream: Arc::new(Mutex::new(None)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            is_speaking: Arc::new(AtomicBool::new(false)),
            deadline: Arc::new(Mutex::new(None)),
            selected_device: Arc::new(Mutex::new(None)),
            units_played: Arc::new(Mutex::new(0)),
        }
    }

    /// Set output device by name (None for default)
    pub fn set_device(&self, device_name: Option<String>) {
        *self.selected_device.lock() = device_name;
    }

    /// List output devices
    pub fn list_devices(&self) -> Result<Vec<String>, ClientError> {
        let devices = self
            .host
            .output_devices()
            .map_err(|e| ClientError::Device(format!("Failed to enumerate output devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Open the output stream. Idempotent; the stream outputs silence
    /// whenever the queue is empty.
    pub fn start(&self) -> Result<(), ClientError> {
        if self.stream.lock().is_some() {
            return Ok(());
        }

        let selected = self.selected_device.lock().clone();
        let device = match selected.as_deref() {
            Some(name) => {
                let devices = self
                    .host
                    .output_devices()
                    .map_err(|e| ClientError::Device(format!("Failed to enumerate devices: {}", e)))?;
                devices
                    .filter(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .next()
                    .ok_or_else(|| ClientError::Device(format!("Device '{}' not found", name)))?
            }
            None => self
                .host
                .default_output_device()
                .ok_or_else(|| ClientError::Device("No output device available".to_string()))?,
        };

        tracing::info!("Using output device: {}", device.name().unwrap_or_default());

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: cpal::SampleRate(PLAYBACK_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let queue = self.queue.clone();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buf = queue.lock();
                    for sample in data.iter_mut() {
                        *sample = buf.pop_front().unwrap_or(0.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| ClientError::Device(format!("Failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| ClientError::Device(format!("Failed to start playback: {}", e)))?;

        *self.stream.lock() = Some(stream);
        Ok(())
    }

    /// Close the output stream and discard anything queued.
    pub fn stop(&self) {
        *self.stream.lock() = None;
        self.queue.lock().clear();
        self.is_speaking.store(false, Ordering::SeqCst);
        *self.deadline.lock() = None;
    }

    /// Begin playing one unit. Fails if a unit is already active; decode
    /// failures leave the scheduler idle.
    pub fn play(&self, unit: &PlaybackUnit) -> Result<(), ClientError> {
        if self.is_speaking.load(Ordering::SeqCst) {
            return Err(ClientError::Device("A playback unit is already active".to_string()));
        }

        let samples = decode_pcm16(&unit.pcm)?;
        if samples.is_empty() {
            return Err(ClientError::Decode("Playback unit is empty".to_string()));
        }

        let duration = unit.duration();
        {
            let mut queue = self.queue.lock();
            queue.clear();
            queue.extend(samples);
        }
        *self.deadline.lock() = Some(Instant::now() + duration + WATCHDOG_SLACK);
        self.is_speaking.store(true, Ordering::SeqCst);
        *self.units_played.lock() += 1;

        tracing::debug!(
            "Playing unit: {} chunks, {} bytes, ~{}ms",
            unit.chunk_count,
            unit.pcm.len(),
            duration.as_millis()
        );
        Ok(())
    }

    /// Check on the active unit. `Completed` and `TimedOut` both leave the
    /// scheduler idle; `TimedOut` drops whatever was still queued.
    pub fn poll(&self) -> PlaybackPoll {
        if !self.is_speaking.load(Ordering::SeqCst) {
            return PlaybackPoll::Idle;
        }

        if self.queue.lock().is_empty() {
            self.is_speaking.store(false, Ordering::SeqCst);
            *self.deadline.lock() = None;
            return PlaybackPoll::Completed;
        }

        let deadline = *self.deadline.lock();
        let expired = deadline.map_or(false, |d| Instant::now() >= d);
        if expired {
            tracing::warn!("Playback watchdog fired, dropping stalled unit");
            self.queue.lock().clear();
            self.is_speaking.store(false, Ordering::SeqCst);
            *self.deadline.lock() = None;
            return PlaybackPoll::TimedOut;
        }

        PlaybackPoll::Playing
    }

    /// Barge-in: stop the active unit immediately and drop queued samples.
    pub fn cancel(&self) {
        let was_speaking = self.is_speaking.swap(false, Ordering::SeqCst);
        self.queue.lock().clear();
        *self.deadline.lock() = None;
        if was_speaking {
            tracing::info!("Playback cancelled (barge-in)");
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::SeqCst)
    }

    pub fn units_played(&self) -> u64 {
        *self.units_played.lock()
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the cpal Stream is only touched behind the Mutex
unsafe impl Send for PlaybackScheduler {}
unsafe impl Sync for PlaybackScheduler {}

/// Decode little-endian PCM16 to normalized f32 samples. An odd trailing
/// byte is dropped with a warning.
fn decode_pcm16(pcm: &[u8]) -> Result<Vec<f32>, ClientError> {
    if pcm.len() % 2 != 0 {
        tracing::warn!("PCM payload has odd length {}, dropping trailing byte", pcm.len());
    }

    Ok(pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(samples: usize) -> PlaybackUnit {
        PlaybackUnit {
            pcm: vec![0x10; samples * 2],
            chunk_count: 1,
        }
    }

    // Tests drive the queue directly; no output stream is opened.

    #[test]
    fn test_only_one_unit_at_a_time() {
        let scheduler = PlaybackScheduler::new();
        scheduler.play(&unit(128)).unwrap();
        assert!(scheduler.is_speaking());
        assert!(scheduler.play(&unit(128)).is_err());
    }

    #[test]
    fn test_empty_unit_rejected_and_stays_idle() {
        let scheduler = PlaybackScheduler::new();
        assert!(scheduler.play(&unit(0)).is_err());
        assert!(!scheduler.is_speaking());
        assert_eq!(scheduler.poll(), PlaybackPoll::Idle);
    }

    #[test]
    fn test_natural_completion_when_queue_drains() {
        let scheduler = PlaybackScheduler::new();
        scheduler.play(&unit(64)).unwrap();
        assert_eq!(scheduler.poll(), PlaybackPoll::Playing);

        // Simulate the output callback consuming everything
        scheduler.queue.lock().clear();
        assert_eq!(scheduler.poll(), PlaybackPoll::Completed);
        assert!(!scheduler.is_speaking());
        assert_eq!(scheduler.poll(), PlaybackPoll::Idle);
    }

    #[test]
    fn test_watchdog_fires_past_deadline() {
        let scheduler = PlaybackScheduler::new();
        scheduler.play(&unit(64)).unwrap();

        // Rewind the deadline instead of sleeping out the slack
        *scheduler.deadline.lock() = Some(Instant::now() - Duration::from_millis(1));
        assert_eq!(scheduler.poll(), PlaybackPoll::TimedOut);
        assert!(!scheduler.is_speaking());
        assert!(scheduler.queue.lock().is_empty());
    }

    #[test]
    fn test_cancel_clears_everything() {
        let scheduler = PlaybackScheduler::new();
        scheduler.play(&unit(256)).unwrap();
        assert!(scheduler.is_speaking());

        scheduler.cancel();
        assert!(!scheduler.is_speaking());
        assert!(scheduler.queue.lock().is_empty());
        assert_eq!(scheduler.poll(), PlaybackPoll::Idle);

        // New unit plays fine after a cancel
        scheduler.play(&unit(64)).unwrap();
        assert!(scheduler.is_speaking());
    }

    #[test]
    fn test_decode_pcm16() {
        let samples = decode_pcm16(&[0x00, 0x00, 0xff, 0x7f, 0x00, 0x80]).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 1.0).abs() < 1e-4);
        assert!(samples[2] < -0.99);

        // Odd tail byte is dropped
        let samples = decode_pcm16(&[0x00, 0x00, 0x42]).unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_watchdog_deadline_uses_estimated_duration() {
        let scheduler = PlaybackScheduler::new();
        // One second of audio at the playback rate
        let one_second = unit(PLAYBACK_SAMPLE_RATE as usize);
        scheduler.play(&one_second).unwrap();

        let deadline = (*scheduler.deadline.lock()).unwrap();
        let expected = Duration::from_secs(1) + WATCHDOG_SLACK;
        let remaining = deadline - Instant::now();
        assert!(remaining > expected - Duration::from_millis(100));
        assert!(remaining <= expected);
    }
}
