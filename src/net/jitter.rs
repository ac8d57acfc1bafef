//! Adaptive jitter buffering for inbound synthesized speech.
//!
//! Chunks queue in arrival order. The target depth adapts to measured
//! jitter and loss within [min, max]; playback release waits for a small
//! chunk floor, then drains the whole queue into one contiguous unit. A
//! zero-length chunk is the utterance-complete signal and forces a
//! release of whatever is queued.

use std::collections::VecDeque;

use super::stats::NetworkStats;
use super::{InboundChunk, PlaybackUnit};

#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    pub min_depth: usize,
    pub max_depth: usize,
    pub initial_depth: usize,
    /// Queued chunks required before the first release of an utterance
    pub min_release_chunks: usize,
    /// Jitter above this grows the buffer
    pub jitter_high_ms: f64,
    /// Jitter below this (with good latency) shrinks it
    pub jitter_low_ms: f64,
    /// Mean latency must be under this for the buffer to shrink
    pub target_latency_ms: f64,
    /// Loss above this grows the buffer
    pub loss_threshold_pct: f64,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            min_depth: 2,
            max_depth: 8,
            initial_depth: 3,
            min_release_chunks: 2,
            jitter_high_ms: 50.0,
            jitter_low_ms: 20.0,
            target_latency_ms: 200.0,
            loss_threshold_pct: 5.0,
        }
    }
}

/// What happened to a chunk handed to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Queued,
    /// Completion signal drained the queue
    ForcedRelease,
    /// Completion signal with nothing queued
    EmptyCompletion,
}

pub struct AdaptiveJitterBuffer {
    config: JitterBufferConfig,
    queue: VecDeque<InboundChunk>,
    target_depth: usize,
    pending_release: Option<PlaybackUnit>,
    /// Mid-utterance: the floor applied to the first release no longer
    /// gates follow-up releases
    releasing: bool,
}

impl AdaptiveJitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        let target_depth = config
            .initial_depth
            .clamp(config.min_depth, config.max_depth);
        Self {
            config,
            queue: VecDeque::new(),
            target_depth,
            pending_release: None,
            releasing: false,
        }
    }

    /// Queue one inbound chunk. A completion signal forces whatever is
    /// queued out as a release; it is never queued itself.
    pub fn push(&mut self, chunk: InboundChunk) -> ChunkOutcome {
        if chunk.is_completion_signal() {
            // The utterance is over either way; the next one buffers to
            // the floor again
            self.releasing = false;
            if self.queue.is_empty() {
                tracing::debug!("Completion signal with empty queue, nothing to release");
                return ChunkOutcome::EmptyCompletion;
            }
            let unit = self.drain();
            tracing::debug!("Completion signal: forcing release of {} chunks", unit.chunk_count);
            self.pending_release = Some(unit);
            return ChunkOutcome::ForcedRelease;
        }

        self.queue.push_back(chunk);
        ChunkOutcome::Queued
    }

    /// Take the next unit to play, if the buffer is ready to release one.
    /// A forced release takes priority. The chunk floor only gates the
    /// first release of an utterance; once releasing, anything queued
    /// chains out immediately so no chunk is stranded.
    pub fn take_release(&mut self) -> Option<PlaybackUnit> {
        if let Some(unit) = self.pending_release.take() {
            return Some(unit);
        }
        let ready = if self.releasing {
            !self.queue.is_empty()
        } else {
            self.queue.len() >= self.config.min_release_chunks
        };
        if ready {
            self.releasing = true;
            return Some(self.drain());
        }
        None
    }

    /// Concatenate and clear the whole queue.
    fn drain(&mut self) -> PlaybackUnit {
        let chunk_count = self.queue.len();
        let total: usize = self.queue.iter().map(|c| c.payload.len()).sum();
        let mut pcm = Vec::with_capacity(total);
        for chunk in self.queue.drain(..) {
            pcm.extend_from_slice(&chunk.payload);
        }
        PlaybackUnit { pcm, chunk_count }
    }

    /// One depth-control step from fresh stats. Adjustments are single
    /// steps, clamped to [min_depth, max_depth].
    pub fn adapt(&mut self, stats: &NetworkStats) {
        let before = self.target_depth;

        if stats.jitter_ms > self.config.jitter_high_ms
            || stats.packet_loss_pct > self.config.loss_threshold_pct
        {
            self.target_depth = (self.target_depth + 1).min(self.config.max_depth);
        } else if stats.jitter_ms < self.config.jitter_low_ms
            && stats.average_latency_ms < self.config.target_latency_ms
        {
            self.target_depth = self.target_depth.saturating_sub(1).max(self.config.min_depth);
        }

        if self.target_depth != before {
            tracing::debug!(
                "Jitter buffer depth {} -> {} (jitter {:.1}ms, latency {:.1}ms, loss {:.1}%)",
                before,
                self.target_depth,
                stats.jitter_ms,
                stats.average_latency_ms,
                stats.packet_loss_pct
            );
        }
    }

    /// Drop everything, including any pending forced release.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending_release = None;
        self.releasing = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.pending_release.is_none()
    }

    pub fn target_depth(&self) -> usize {
        self.target_depth
    }
}

impl Default for AdaptiveJitterBuffer {
    fn default() -> Self {
        Self::new(JitterBufferConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(len: usize) -> InboundChunk {
        InboundChunk::new(vec![0xab; len])
    }

    fn stats(jitter: f64, latency: f64, loss: f64) -> NetworkStats {
        NetworkStats {
            average_latency_ms: latency,
            jitter_ms: jitter,
            packet_loss_pct: loss,
            buffer_depth: 0,
            queued_chunks: 0,
        }
    }

    #[test]
    fn test_no_release_below_floor() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.push(chunk(10));
        assert!(buffer.take_release().is_none());
    }

    #[test]
    fn test_release_drains_whole_queue_in_order() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.push(InboundChunk::new(vec![1, 1]));
        buffer.push(InboundChunk::new(vec![2, 2]));
        buffer.push(InboundChunk::new(vec![3, 3]));

        let unit = buffer.take_release().unwrap();
        assert_eq!(unit.chunk_count, 3);
        assert_eq!(unit.pcm, vec![1, 1, 2, 2, 3, 3]);
        assert!(buffer.is_empty());
        assert!(buffer.take_release().is_none());
    }

    #[test]
    fn test_five_chunks_release_then_requeue() {
        let mut buffer = AdaptiveJitterBuffer::default();

        buffer.push(chunk(4));
        assert!(buffer.take_release().is_none());
        buffer.push(chunk(4));

        // Floor reached: first release takes both accumulated chunks
        let unit = buffer.take_release().unwrap();
        assert_eq!(unit.chunk_count, 2);

        // Three more arrive while that unit plays
        buffer.push(chunk(4));
        buffer.push(chunk(4));
        buffer.push(chunk(4));
        assert_eq!(buffer.len(), 3);

        let next = buffer.take_release().unwrap();
        assert_eq!(next.chunk_count, 3);
        assert_eq!(next.pcm.len(), 12);
    }

    #[test]
    fn test_lone_chunk_chains_after_first_release() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.push(chunk(4));
        buffer.push(chunk(4));
        assert!(buffer.take_release().is_some());

        // A single straggler queued mid-playback must not be stranded
        // waiting for a second chunk once the active unit completes
        buffer.push(chunk(4));
        let unit = buffer.take_release().unwrap();
        assert_eq!(unit.chunk_count, 1);
        assert_eq!(unit.pcm.len(), 4);
    }

    #[test]
    fn test_floor_reapplies_after_utterance_completes() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.push(chunk(4));
        buffer.push(chunk(4));
        assert!(buffer.take_release().is_some());

        // Utterance ends; the next one buffers up to the floor again
        buffer.push(InboundChunk::new(vec![]));
        buffer.push(chunk(4));
        assert!(buffer.take_release().is_none());
        buffer.push(chunk(4));
        assert_eq!(buffer.take_release().unwrap().chunk_count, 2);
    }

    #[test]
    fn test_clear_resets_chaining() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.push(chunk(4));
        buffer.push(chunk(4));
        assert!(buffer.take_release().is_some());

        buffer.clear();
        buffer.push(chunk(4));
        assert!(buffer.take_release().is_none());
    }

    #[test]
    fn test_completion_signal_forces_release_of_single_chunk() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.push(chunk(6));
        assert!(buffer.take_release().is_none());

        assert_eq!(buffer.push(InboundChunk::new(vec![])), ChunkOutcome::ForcedRelease);
        let unit = buffer.take_release().unwrap();
        assert_eq!(unit.chunk_count, 1);
        assert_eq!(unit.pcm.len(), 6);
    }

    #[test]
    fn test_completion_signal_on_empty_queue_is_ignored() {
        let mut buffer = AdaptiveJitterBuffer::default();
        assert_eq!(buffer.push(InboundChunk::new(vec![])), ChunkOutcome::EmptyCompletion);
        assert!(buffer.take_release().is_none());
    }

    #[test]
    fn test_high_jitter_grows_depth_one_step() {
        let mut buffer = AdaptiveJitterBuffer::default();
        assert_eq!(buffer.target_depth(), 3);
        buffer.adapt(&stats(80.0, 100.0, 0.0));
        assert_eq!(buffer.target_depth(), 4);
    }

    #[test]
    fn test_depth_clamped_at_max() {
        let mut buffer = AdaptiveJitterBuffer::default();
        for _ in 0..20 {
            buffer.adapt(&stats(120.0, 100.0, 0.0));
        }
        assert_eq!(buffer.target_depth(), 8);
    }

    #[test]
    fn test_depth_clamped_at_min() {
        let mut buffer = AdaptiveJitterBuffer::default();
        for _ in 0..20 {
            buffer.adapt(&stats(5.0, 50.0, 0.0));
        }
        assert_eq!(buffer.target_depth(), 2);
    }

    #[test]
    fn test_loss_grows_depth() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.adapt(&stats(10.0, 100.0, 7.5));
        assert_eq!(buffer.target_depth(), 4);
    }

    #[test]
    fn test_low_jitter_high_latency_holds_depth() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.adapt(&stats(10.0, 350.0, 0.0));
        assert_eq!(buffer.target_depth(), 3);
    }

    #[test]
    fn test_clear_drops_pending_release() {
        let mut buffer = AdaptiveJitterBuffer::default();
        buffer.push(chunk(4));
        buffer.push(InboundChunk::new(vec![]));
        buffer.clear();
        assert!(buffer.take_release().is_none());
        assert!(buffer.is_empty());
    }
}
