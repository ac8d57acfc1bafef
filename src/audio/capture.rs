//! Microphone capture via cpal.
//!
//! The capture callback runs on the device's real-time thread; it feeds
//! an `AudioFramer` owned by the closure and never touches session state
//! directly. Frames cross to the event loop over an mpsc channel.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Host, SampleFormat, Stream};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ClientError;

use super::framer::AudioFramer;
use super::vad::{frame_rms, rms_to_level};
use super::FrameEvent;

pub struct CaptureService {
    host: Host,
    stream: Arc<Mutex<Option<Stream>>>,
    is_capturing: Arc<AtomicBool>,
    selected_device: Arc<Mutex<Option<String>>>,
    current_level: Arc<Mutex<f32>>,
    enhance: bool,
}

impl CaptureService {
    pub fn new(enhance: bool) -> Self {
        Self {
            host: cpal::default_host(),
            stream: Arc::new(Mutex::new(None)),
            is_capturing: Arc::new(AtomicBool::new(false)),
            selected_device: Arc::new(Mutex::new(None)),
            current_level: Arc::new(Mutex::new(0.0)),
            enhance,
        }
    }

    /// Set input device by name (None for default)
    pub fn set_device(&self, device_name: Option<String>) {
        *self.selected_device.lock() = device_name;
    }

    /// List input devices
    pub fn list_devices(&self) -> Result<Vec<String>, ClientError> {
        let devices = self
            .host
            .input_devices()
            .map_err(|e| ClientError::Device(format!("Failed to enumerate input devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn get_device(&self, name: Option<&str>) -> Result<cpal::Device, ClientError> {
        match name {
            Some(device_name) => {
                let devices = self
                    .host
                    .input_devices()
                    .map_err(|e| ClientError::Device(format!("Failed to enumerate devices: {}", e)))?;

                for device in devices {
                    if let Ok(n) = device.name() {
                        if n == device_name {
                            return Ok(device);
                        }
                    }
                }
                Err(ClientError::Device(format!("Device '{}' not found", device_name)))
            }
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| ClientError::Permission("No input device available".to_string())),
        }
    }

    /// Start capture, emitting one `FrameEvent` per complete frame.
    pub fn start(&self, frame_tx: mpsc::UnboundedSender<FrameEvent>) -> Result<(), ClientError> {
        if self.is_capturing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let selected = self.selected_device.lock().clone();
        let device = self.get_device(selected.as_deref())?;

        let device_name = device.name().unwrap_or_default();
        tracing::info!("Starting audio capture on: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| ClientError::Device(format!("Failed to get input config: {}", e)))?;

        let config = supported_config.config();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let mut framer = AudioFramer::new(sample_rate, self.enhance, frame_tx);
        let current_level = self.current_level.clone();

        let err_fn = |err| {
            tracing::error!("Audio capture error: {}", err);
        };

        let stream = match supported_config.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    *current_level.lock() = rms_to_level(frame_rms(data));
                    framer.push(data, channels);
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let float_data: Vec<f32> =
                        data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                    *current_level.lock() = rms_to_level(frame_rms(&float_data));
                    framer.push(&float_data, channels);
                },
                err_fn,
                None,
            ),
            format => {
                return Err(ClientError::Device(format!(
                    "Unsupported sample format: {:?}",
                    format
                )));
            }
        }
        .map_err(|e| ClientError::Device(format!("Failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| ClientError::Device(format!("Failed to start capture: {}", e)))?;

        *self.stream.lock() = Some(stream);
        self.is_capturing.store(true, Ordering::SeqCst);

        tracing::info!("Audio capture started ({}Hz, {} channels)", sample_rate, channels);
        Ok(())
    }

    /// Stop capture and drop the stream.
    pub fn stop(&self) {
        if !self.is_capturing.load(Ordering::SeqCst) {
            return;
        }

        *self.stream.lock() = None;
        self.is_capturing.store(false, Ordering::SeqCst);
        *self.current_level.lock() = 0.0;

        tracing::info!("Audio capture stopped");
    }

    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::SeqCst)
    }

    /// Normalized input level for observability (-60dB floor).
    pub fn current_level(&self) -> f32 {
        *self.current_level.lock()
    }
}

// Safety: the cpal Stream is only touched behind the Mutex
unsafe impl Send for CaptureService {}
unsafe impl Sync for CaptureService {}
