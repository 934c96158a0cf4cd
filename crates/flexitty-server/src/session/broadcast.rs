//! Fan-out of terminal output to every attached sink.
//!
//! The member list and the send-to-everyone loop share one async mutex, so
//! two deliveries never interleave and an attach never lands halfway through
//! a fan-out. A sink that errors or exceeds the send timeout is dropped from
//! the group once the fan-out finishes, and its cancellation token fires so
//! whatever serves that sink's input stops too.

use super::ring_buffer::RingBuffer;
use flexitty_core::{FlexiError, FlexiResult, Sink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifier of a sink within one group.
pub type SinkId = u64;

struct Member {
    id: SinkId,
    sink: Arc<dyn Sink>,
    /// Output stream offset this sink has already seen through history
    /// replay. Bytes before it are not sent again.
    resume_at: u64,
    /// Cancelled when the group drops this sink after a failed delivery.
    cancel: CancellationToken,
}

/// The set of sinks attached to one session.
pub struct BroadcastGroup {
    members: Mutex<Vec<Member>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl BroadcastGroup {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            members: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    fn allocate_id(&self) -> SinkId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a sink for all subsequent deliveries. No history is replayed.
    ///
    /// `cancel` is fired if the group later drops the sink.
    pub async fn attach(&self, sink: Arc<dyn Sink>, cancel: CancellationToken) -> SinkId {
        let id = self.allocate_id();
        let mut members = self.members.lock().await;
        debug!(sink_id = id, sink = %sink.label(), "sink attached");
        members.push(Member {
            id,
            sink,
            resume_at: 0,
            cancel,
        });
        id
    }

    /// Send the current contents of `history` to `sink`, then register it.
    ///
    /// Runs under the group lock, so no live chunk can slip between the
    /// snapshot and the registration. If the replay send fails the sink is
    /// not registered.
    pub async fn attach_with_replay(
        &self,
        sink: Arc<dyn Sink>,
        history: &RingBuffer,
        cancel: CancellationToken,
    ) -> FlexiResult<SinkId> {
        let id = self.allocate_id();
        let mut members = self.members.lock().await;

        let resume_at = match history.snapshot() {
            Ok((bytes, offset)) => {
                self.send_one(sink.as_ref(), &bytes).await?;
                debug!(sink_id = id, replayed = bytes.len(), "history replayed");
                offset
            }
            Err(FlexiError::BufferEmpty) => history.total_written(),
            Err(e) => return Err(e),
        };

        debug!(sink_id = id, sink = %sink.label(), "sink attached");
        members.push(Member {
            id,
            sink,
            resume_at,
            cancel,
        });
        Ok(id)
    }

    /// Remove a sink. Returns false if it was already gone.
    pub async fn detach(&self, id: SinkId) -> bool {
        let mut members = self.members.lock().await;
        let before = members.len();
        members.retain(|m| m.id != id);
        let removed = members.len() != before;
        if removed {
            debug!(sink_id = id, remaining = members.len(), "sink detached");
        }
        removed
    }

    /// Send `data` to every sink. Returns how many sinks accepted it.
    pub async fn deliver(&self, data: &[u8]) -> usize {
        self.fan_out(data, None).await
    }

    /// Like [`deliver`](Self::deliver), for a chunk of the terminal's output
    /// stream ending at byte offset `end_offset`. Sinks that already received
    /// (part of) this chunk through history replay only get the remainder.
    pub async fn deliver_at(&self, data: &[u8], end_offset: u64) -> usize {
        self.fan_out(data, Some(end_offset)).await
    }

    async fn fan_out(&self, data: &[u8], end_offset: Option<u64>) -> usize {
        let mut members = self.members.lock().await;
        let mut failed = Vec::new();
        let mut delivered = 0;

        for member in members.iter() {
            let payload = match end_offset {
                Some(end) => {
                    let start = end.saturating_sub(data.len() as u64);
                    let skip = member.resume_at.saturating_sub(start).min(data.len() as u64);
                    &data[skip as usize..]
                }
                None => data,
            };
            if payload.is_empty() {
                continue;
            }

            match self.send_one(member.sink.as_ref(), payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        sink_id = member.id,
                        sink = %member.sink.label(),
                        error = %e,
                        "delivery failed, dropping sink"
                    );
                    member.cancel.cancel();
                    failed.push(member.id);
                }
            }
        }

        if !failed.is_empty() {
            members.retain(|m| !failed.contains(&m.id));
        }
        delivered
    }

    async fn send_one(&self, sink: &dyn Sink, data: &[u8]) -> FlexiResult<()> {
        match tokio::time::timeout(self.send_timeout, sink.send(data)).await {
            Ok(result) => result,
            Err(_) => Err(FlexiError::Timeout),
        }
    }

    /// Number of attached sinks.
    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::MockSink;

    fn group() -> BroadcastGroup {
        BroadcastGroup::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn delivers_identical_bytes_to_all_sinks() {
        let g = group();
        let sinks: Vec<_> = (0..3).map(|_| MockSink::new().0).collect();
        for s in &sinks {
            g.attach(s.clone(), CancellationToken::new()).await;
        }
        let (failing, _tx) = MockSink::failing();
        let dropped = CancellationToken::new();
        g.attach(failing.clone(), dropped.clone()).await;

        let delivered = g.deliver(b"payload X").await;
        assert_eq!(delivered, 3);
        for s in &sinks {
            assert_eq!(s.received(), b"payload X");
        }
        // The broken sink is gone and told so; the healthy ones stay.
        assert_eq!(g.len().await, 3);
        assert!(dropped.is_cancelled());
    }

    #[tokio::test]
    async fn slow_sink_times_out_and_is_dropped() {
        let g = group();
        let (fast, _tx) = MockSink::new();
        let slow = MockSink::stalled();
        let slow_cancel = CancellationToken::new();
        let fast_cancel = CancellationToken::new();
        g.attach(slow.clone(), slow_cancel.clone()).await;
        g.attach(fast.clone(), fast_cancel.clone()).await;

        assert_eq!(g.deliver(b"abc").await, 1);
        assert_eq!(fast.received(), b"abc");
        assert_eq!(g.len().await, 1);
        assert!(slow_cancel.is_cancelled());
        assert!(!fast_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn detach_stops_delivery() {
        let g = group();
        let (a, _ta) = MockSink::new();
        let (b, _tb) = MockSink::new();
        let id_a = g.attach(a.clone(), CancellationToken::new()).await;
        g.attach(b.clone(), CancellationToken::new()).await;

        assert!(g.detach(id_a).await);
        assert!(!g.detach(id_a).await);
        g.deliver(b"after").await;
        assert!(a.received().is_empty());
        assert_eq!(b.received(), b"after");
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gap_or_duplicate() {
        let g = group();
        let history = RingBuffer::new(64);

        // Chunk already recorded in history but not yet fanned out.
        history.write(b"hello ");
        let (late, _tx) = MockSink::new();
        g.attach_with_replay(late.clone(), &history, CancellationToken::new())
            .await
            .unwrap();
        g.deliver_at(b"hello ", history.total_written()).await;

        history.write(b"world");
        g.deliver_at(b"world", history.total_written()).await;

        assert_eq!(late.received(), b"hello world");
    }

    #[tokio::test]
    async fn replay_of_empty_history_sends_nothing() {
        let g = group();
        let history = RingBuffer::new(16);
        let (sink, _tx) = MockSink::new();
        g.attach_with_replay(sink.clone(), &history, CancellationToken::new())
            .await
            .unwrap();
        assert!(sink.received().is_empty());
        assert_eq!(g.len().await, 1);
    }

    #[tokio::test]
    async fn failed_replay_does_not_register() {
        let g = group();
        let history = RingBuffer::new(16);
        history.write(b"x");
        let (sink, _tx) = MockSink::failing();
        assert!(g
            .attach_with_replay(sink, &history, CancellationToken::new())
            .await
            .is_err());
        assert!(g.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_deliveries_do_not_interleave() {
        let g = Arc::new(group());
        let (sink, _tx) = MockSink::new();
        g.attach(sink.clone(), CancellationToken::new()).await;

        let a = vec![b'a'; 4096];
        let b = vec![b'b'; 4096];
        let (ga, gb) = (g.clone(), g.clone());
        let ta = tokio::spawn(async move { ga.deliver(&a).await });
        let tb = tokio::spawn(async move { gb.deliver(&b).await });
        ta.await.unwrap();
        tb.await.unwrap();

        let got = sink.received();
        assert_eq!(got.len(), 8192);
        let first = got[0];
        assert!(got[..4096].iter().all(|c| *c == first));
        assert!(got[4096..].iter().all(|c| *c != first));
    }
}
