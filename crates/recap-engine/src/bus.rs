//! In-process progress bus.
//!
//! One publisher per job with a strictly increasing sequence, a bounded
//! replay ring of the most recent events, and live fan-out over a
//! broadcast channel. Slow subscribers are dropped (they observe a lag
//! error) rather than backpressuring the controller; the job store is
//! the source of truth and a dropped subscriber resyncs from a snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::trace;

use recap_models::{JobId, ProgressEvent};

/// Events kept for replay per job.
const DEFAULT_RING_CAPACITY: usize = 64;

struct JobChannel {
    next_seq: u64,
    ring: VecDeque<ProgressEvent>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl JobChannel {
    fn new(seed_seq: u64, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            next_seq: seed_seq,
            ring: VecDeque::with_capacity(capacity),
            sender,
        }
    }
}

/// Per-job fan-out of progress events to any number of subscribers.
pub struct ProgressBus {
    capacity: usize,
    channels: Mutex<HashMap<String, JobChannel>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register a job's channel, seeding the sequence from the stored
    /// high-water mark so sequences stay strictly increasing across
    /// crash recovery.
    pub fn ensure(&self, job_id: &JobId, seed_seq: u64) {
        let mut channels = self.channels.lock().expect("progress bus poisoned");
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| JobChannel::new(seed_seq, self.capacity));
    }

    /// Allocate the next sequence number for a job.
    pub fn next_seq(&self, job_id: &JobId) -> u64 {
        let mut channels = self.channels.lock().expect("progress bus poisoned");
        let channel = channels
            .entry(job_id.to_string())
            .or_insert_with(|| JobChannel::new(0, self.capacity));
        channel.next_seq += 1;
        channel.next_seq
    }

    /// Publish an event to the ring and to live subscribers.
    /// Non-blocking; a send with no receivers is fine.
    pub fn publish(&self, event: ProgressEvent) {
        let terminal = event.is_terminal();
        let mut channels = self.channels.lock().expect("progress bus poisoned");
        let key = event.job_id.to_string();
        let channel = channels
            .entry(key.clone())
            .or_insert_with(|| JobChannel::new(event.sequence.saturating_sub(1), self.capacity));

        if channel.ring.len() == self.capacity {
            channel.ring.pop_front();
        }
        channel.ring.push_back(event.clone());
        channel.next_seq = channel.next_seq.max(event.sequence);

        trace!(job_id = %event.job_id, sequence = event.sequence, "Publishing progress event");
        let _ = channel.sender.send(event);

        // Terminal event closes the channel; late subscribers resync from
        // the job-store snapshot instead.
        if terminal {
            channels.remove(&key);
        }
    }

    /// Subscribe to a job's events.
    ///
    /// Returns the ring tail newer than `last_seen` plus a live receiver,
    /// or `None` if the job has no channel (terminal or never started) --
    /// the caller then serves the snapshot alone.
    pub fn subscribe(
        &self,
        job_id: &JobId,
        last_seen: Option<u64>,
    ) -> Option<(Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>)> {
        let channels = self.channels.lock().expect("progress bus poisoned");
        let channel = channels.get(job_id.as_str())?;

        let floor = last_seen.unwrap_or(0);
        let replay: Vec<ProgressEvent> = channel
            .ring
            .iter()
            .filter(|e| e.sequence > floor)
            .cloned()
            .collect();

        Some((replay, channel.sender.subscribe()))
    }

    /// Number of live job channels. Used by tests and diagnostics.
    pub fn live_channels(&self) -> usize {
        self.channels.lock().expect("progress bus poisoned").len()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recap_models::{BlobHandle, Job, JobConfig, JobStage};

    fn event(job: &Job, seq: u64, stage: JobStage, progress: f64) -> ProgressEvent {
        let mut job = job.clone();
        job.stage = stage;
        job.progress = progress;
        ProgressEvent::from_job(&job, seq)
    }

    fn sample_job() -> Job {
        Job::new(
            "user-1",
            BlobHandle::new("media", "s.mp4"),
            600.0,
            JobConfig::default(),
        )
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let bus = ProgressBus::new();
        let job = sample_job();
        bus.ensure(&job.id, 0);

        let a = bus.next_seq(&job.id);
        let b = bus.next_seq(&job.id);
        assert!(b > a);
    }

    #[test]
    fn test_seed_survives_recovery() {
        let bus = ProgressBus::new();
        let job = sample_job();
        // A recovered job seeds from its stored high-water mark.
        bus.ensure(&job.id, 41);
        assert_eq!(bus.next_seq(&job.id), 42);
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let bus = ProgressBus::new();
        let job = sample_job();
        bus.ensure(&job.id, 0);

        for seq in 1..=3 {
            bus.publish(event(&job, seq, JobStage::Planning, 12.0));
        }

        let (replay, mut live) = bus.subscribe(&job.id, Some(1)).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].sequence, 2);

        bus.publish(event(&job, 4, JobStage::SegmentProcessing, 25.0));
        let received = live.recv().await.unwrap();
        assert_eq!(received.sequence, 4);
    }

    #[test]
    fn test_ring_bounded() {
        let bus = ProgressBus::with_capacity(4);
        let job = sample_job();
        bus.ensure(&job.id, 0);

        for seq in 1..=10 {
            bus.publish(event(&job, seq, JobStage::SegmentProcessing, 30.0));
        }

        let (replay, _live) = bus.subscribe(&job.id, None).unwrap();
        assert_eq!(replay.len(), 4);
        assert_eq!(replay.first().unwrap().sequence, 7);
    }

    #[test]
    fn test_terminal_prunes_channel() {
        let bus = ProgressBus::new();
        let job = sample_job();
        bus.ensure(&job.id, 0);

        bus.publish(event(&job, 1, JobStage::Planning, 12.0));
        assert_eq!(bus.live_channels(), 1);

        bus.publish(event(&job, 2, JobStage::Completed, 100.0));
        assert_eq!(bus.live_channels(), 0);
        assert!(bus.subscribe(&job.id, None).is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_out() {
        let bus = ProgressBus::with_capacity(4);
        let job = sample_job();
        bus.ensure(&job.id, 0);
        bus.publish(event(&job, 1, JobStage::Planning, 12.0));

        let (_, mut live) = bus.subscribe(&job.id, None).unwrap();
        // Overflow the broadcast buffer without draining.
        for seq in 2..=20 {
            bus.publish(event(&job, seq, JobStage::SegmentProcessing, 30.0));
        }

        match live.recv().await {
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
