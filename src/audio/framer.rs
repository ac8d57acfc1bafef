//! Turns raw capture callbacks into wire-ready frames.
//!
//! Accumulates interleaved device samples, mixes down to mono, slices
//! fixed 1024-sample frames, runs the VAD, decimates to the 16kHz wire
//! rate and emits one PCM16 `FrameEvent` per frame.

use tokio::sync::mpsc;

use super::vad::{frame_rms, EnergyVad, VadConfig};
use super::{AudioFrame, FrameEvent, FRAME_SIZE, WIRE_SAMPLE_RATE};

pub struct AudioFramer {
    source_rate: u32,
    enhance: bool,
    pending: Vec<f32>,
    vad: EnergyVad,
    sequence: u64,
    // DC-block filter state
    prev_input: f32,
    prev_output: f32,
    frame_tx: mpsc::UnboundedSender<FrameEvent>,
}

/// DC-block pole; close to 1.0 keeps the passband flat above ~20Hz
const DC_BLOCK_COEFF: f32 = 0.995;
/// Fixed capture gain applied after the DC block
const CAPTURE_GAIN: f32 = 1.5;

impl AudioFramer {
    pub fn new(source_rate: u32, enhance: bool, frame_tx: mpsc::UnboundedSender<FrameEvent>) -> Self {
        Self {
            source_rate,
            enhance,
            pending: Vec::with_capacity(FRAME_SIZE * 2),
            vad: EnergyVad::new(VadConfig::default()),
            sequence: 0,
            prev_input: 0.0,
            prev_output: 0.0,
            frame_tx,
        }
    }

    /// Feed one capture callback's worth of interleaved samples.
    /// Empty input is a no-op. Returns the number of frames emitted.
    pub fn push(&mut self, data: &[f32], channels: usize) -> usize {
        if data.is_empty() || channels == 0 {
            return 0;
        }

        if channels > 1 {
            for chunk in data.chunks(channels) {
                let mono: f32 = chunk.iter().sum::<f32>() / channels as f32;
                self.pending.push(mono);
            }
        } else {
            self.pending.extend_from_slice(data);
        }

        let mut emitted = 0;
        while self.pending.len() >= FRAME_SIZE {
            let samples: Vec<f32> = self.pending.drain(..FRAME_SIZE).collect();
            self.emit_frame(samples);
            emitted += 1;
        }
        emitted
    }

    fn emit_frame(&mut self, mut samples: Vec<f32>) {
        if self.enhance {
            self.enhance_in_place(&mut samples);
        }

        let rms = frame_rms(&samples);
        let energy = self.vad.process(rms);
        let voice_active = self.vad.is_active();

        let wire = decimate(&samples, self.source_rate, WIRE_SAMPLE_RATE);
        let pcm: Vec<i16> = wire
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();

        let event = FrameEvent {
            frame: AudioFrame {
                samples: pcm,
                sample_rate: WIRE_SAMPLE_RATE,
                sequence: self.sequence,
            },
            voice_active,
            energy,
        };
        self.sequence += 1;

        // Receiver gone means the session is tearing down; drop the frame
        let _ = self.frame_tx.send(event);
    }

    /// One-pole DC block followed by a fixed gain, clamped to [-1, 1].
    fn enhance_in_place(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let input = *sample;
            let output = input - self.prev_input + DC_BLOCK_COEFF * self.prev_output;
            self.prev_input = input;
            self.prev_output = output;
            *sample = (output * CAPTURE_GAIN).clamp(-1.0, 1.0);
        }
    }

    pub fn is_voice_active(&self) -> bool {
        self.vad.is_active()
    }
}

/// Decimate by picking evenly spaced samples at the rate ratio.
/// Rates at or below the target pass through unchanged.
fn decimate(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate <= target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (samples.len() as f64 / ratio).floor() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = (i as f64 * ratio) as usize;
        output.push(samples[src_idx.min(samples.len() - 1)]);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer(source_rate: u32) -> (AudioFramer, mpsc::UnboundedReceiver<FrameEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AudioFramer::new(source_rate, false, tx), rx)
    }

    #[test]
    fn test_empty_input_is_noop() {
        let (mut framer, mut rx) = framer(48_000);
        assert_eq!(framer.push(&[], 1), 0);
        assert_eq!(framer.push(&[0.1; 64], 0), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emits_one_event_per_full_frame() {
        let (mut framer, mut rx) = framer(48_000);

        assert_eq!(framer.push(&[0.1; 1000], 1), 0);
        assert!(rx.try_recv().is_err());

        // 1000 + 1100 = 2100 samples: two complete frames, 52 left pending
        assert_eq!(framer.push(&[0.1; 1100], 1), 2);
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(first.frame.sequence, 0);
        assert_eq!(second.frame.sequence, 1);
    }

    #[test]
    fn test_stereo_mixdown() {
        let (mut framer, mut rx) = framer(48_000);

        // L = 0.4, R = 0.0 interleaved: mono should average to 0.2
        let mut data = Vec::with_capacity(FRAME_SIZE * 2);
        for _ in 0..FRAME_SIZE {
            data.push(0.4);
            data.push(0.0);
        }
        assert_eq!(framer.push(&data, 2), 1);
        let event = rx.try_recv().unwrap();
        let expected = (0.2f32 * i16::MAX as f32) as i16;
        assert!(event.frame.samples.iter().all(|&s| (s - expected).abs() <= 1));
    }

    #[test]
    fn test_decimation_to_wire_rate() {
        let (mut framer, mut rx) = framer(48_000);
        framer.push(&[0.1; FRAME_SIZE], 1);
        let event = rx.try_recv().unwrap();
        // 48kHz -> 16kHz is a 3:1 ratio
        assert_eq!(event.frame.samples.len(), FRAME_SIZE / 3);
        assert_eq!(event.frame.sample_rate, WIRE_SAMPLE_RATE);
    }

    #[test]
    fn test_source_at_wire_rate_passes_through() {
        let (mut framer, mut rx) = framer(WIRE_SAMPLE_RATE);
        framer.push(&[0.1; FRAME_SIZE], 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.frame.samples.len(), FRAME_SIZE);
    }

    #[test]
    fn test_decimate_preserves_order() {
        let samples: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let out = decimate(&samples, 48_000, 16_000);
        assert_eq!(out, vec![0.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_vad_rides_along() {
        let (mut framer, mut rx) = framer(48_000);

        for _ in 0..2 {
            framer.push(&[0.5; FRAME_SIZE], 1);
            assert!(!rx.try_recv().unwrap().voice_active);
        }
        framer.push(&[0.5; FRAME_SIZE], 1);
        let event = rx.try_recv().unwrap();
        assert!(event.voice_active);
        assert!(event.energy > 0.4);
    }

    #[test]
    fn test_enhancement_removes_dc_offset() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut framer = AudioFramer::new(WIRE_SAMPLE_RATE, true, tx);

        // Constant positive offset should decay towards zero
        for _ in 0..8 {
            framer.push(&[0.3; FRAME_SIZE], 1);
        }
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        let tail_avg: f32 = last.frame.samples[FRAME_SIZE - 64..]
            .iter()
            .map(|&s| s as f32 / i16::MAX as f32)
            .sum::<f32>()
            / 64.0;
        assert!(tail_avg.abs() < 0.01, "DC offset should be filtered, got {}", tail_avg);
    }
}
