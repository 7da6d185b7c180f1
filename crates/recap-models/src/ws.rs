//! Live-subscription message envelope.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::JobSnapshot;
use crate::progress::ProgressEvent;

/// Messages delivered over a live job subscription, in order:
/// one `initial` with the current snapshot, any number of `update`
/// deltas, then one `terminal` after which the channel closes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    /// Current snapshot at subscription time
    Initial { snapshot: JobSnapshot },
    /// Live progress delta
    Update { event: ProgressEvent },
    /// The job became terminal; no further messages follow
    Terminal { event: ProgressEvent },
}

impl WsEvent {
    /// Sequence carried by the message, if any. The initial snapshot
    /// reports the high-water mark so reconnecting clients can skip replay.
    pub fn sequence(&self) -> u64 {
        match self {
            WsEvent::Initial { snapshot } => snapshot.event_seq,
            WsEvent::Update { event } | WsEvent::Terminal { event } => event.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobHandle;
    use crate::job::{Job, JobConfig};

    #[test]
    fn test_ws_event_tagging() {
        let job = Job::new(
            "user-1",
            BlobHandle::new("media", "s.mp4"),
            60.0,
            JobConfig::default(),
        );
        let msg = WsEvent::Initial {
            snapshot: job.snapshot(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"initial\""));
    }
}
