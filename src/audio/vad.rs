//! Energy-based voice activity detection.
//!
//! Operates on per-frame RMS energy: a rolling average over the last few
//! frames is compared against a dual-threshold hysteresis band, and state
//! only flips after a run of consecutive frames agrees. Values inside the
//! band leave the state untouched.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Rolling average window, in frames
    pub window_frames: usize,
    /// Average energy above this marks a speech candidate
    pub active_threshold: f32,
    /// Average energy below this marks a silence candidate
    pub silence_threshold: f32,
    /// Consecutive speech candidates required to flip active
    pub activation_frames: u32,
    /// Consecutive silence candidates required to flip inactive
    pub deactivation_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            window_frames: 10,
            active_threshold: 0.02,
            silence_threshold: 0.01,
            activation_frames: 3,
            deactivation_frames: 5,
        }
    }
}

pub struct EnergyVad {
    config: VadConfig,
    window: VecDeque<f32>,
    voice_frames: u32,
    silence_frames: u32,
    active: bool,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        let window = VecDeque::with_capacity(config.window_frames);
        Self {
            config,
            window,
            voice_frames: 0,
            silence_frames: 0,
            active: false,
        }
    }

    /// Feed one frame's RMS energy. Returns the smoothed energy the
    /// decision was made on.
    pub fn process(&mut self, rms: f32) -> f32 {
        if self.window.len() == self.config.window_frames {
            self.window.pop_front();
        }
        self.window.push_back(rms);

        let average = self.window.iter().sum::<f32>() / self.window.len() as f32;

        if average > self.config.active_threshold {
            self.voice_frames += 1;
            self.silence_frames = 0;
            if !self.active && self.voice_frames >= self.config.activation_frames {
                self.active = true;
                tracing::debug!("Voice activity started (energy {:.4})", average);
            }
        } else if average < self.config.silence_threshold {
            self.silence_frames += 1;
            self.voice_frames = 0;
            if self.active && self.silence_frames >= self.config.deactivation_frames {
                self.active = false;
                tracing::debug!("Voice activity ended (energy {:.4})", average);
            }
        }
        // Inside the hysteresis band: state and run counters hold

        average
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.voice_frames = 0;
        self.silence_frames = 0;
        self.active = false;
    }
}

/// RMS of a frame of normalized samples.
pub fn frame_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert RMS to a normalized 0..1 level on a -60dB floor.
pub fn rms_to_level(rms: f32) -> f32 {
    let db = 20.0 * rms.max(1e-10).log10();
    let normalized = (db + 60.0) / 60.0;
    normalized.clamp(0.0, 1.0)
}
