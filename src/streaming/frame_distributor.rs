//! Frame fan-out from the single capture producer to every HTTP viewer
//!
//! Built on `tokio::sync::broadcast`: each subscriber reads from a shared
//! bounded ring, so `publish` never waits on a viewer. A viewer that falls
//! more than `capacity` frames behind loses its oldest frames and resumes
//! with the newest ones still buffered (most-recent-frame-wins).
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

use super::frame::Frame;

/// Statistics for monitoring frame distribution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributorStats {
    pub frames_sent: u64,
    pub frames_unwatched: u64,
    pub subscribers: usize,
    pub capacity: usize,
    pub closed: bool,
}

/// Broadcasts frames to any number of subscribers.
///
/// All methods take `&self`; share it behind an `Arc`.
pub struct FrameDistributor {
    tx: RwLock<Option<broadcast::Sender<Frame>>>,
    capacity: usize,
    next_subscriber_id: AtomicU64,
    frames_sent: AtomicU64,
    frames_unwatched: AtomicU64,
}

impl FrameDistributor {
    /// Create new frame distributor
    ///
    /// `capacity` is the number of frames a subscriber may fall behind
    /// before its oldest frames are dropped. The broadcast ring rounds it
    /// up to a power of two, and [`FrameDistributor::capacity`] reports
    /// the rounded value.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let (tx, _rx) = broadcast::channel(capacity);

        info!(capacity, "Frame distributor created");

        Self {
            tx: RwLock::new(Some(tx)),
            capacity,
            next_subscriber_id: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_unwatched: AtomicU64::new(0),
        }
    }

    /// Publish a frame to all current subscribers.
    ///
    /// Returns how many subscribers the frame was queued for. Having no
    /// subscribers, or being closed, is not an error.
    pub fn publish(&self, frame: Frame) -> usize {
        let tx = self.tx.read();
        let Some(tx) = tx.as_ref() else {
            debug!(sequence = frame.sequence(), "Distributor closed, frame discarded");
            return 0;
        };

        match tx.send(frame) {
            Ok(n) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                n
            }
            Err(_) => {
                self.frames_unwatched.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Register a new subscriber.
    ///
    /// The subscription sees frames published after this call returns,
    /// never earlier ones. Subscribing to a closed distributor yields a
    /// subscription that is already closed.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let rx = match self.tx.read().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };

        info!(subscriber = id, subscribers = self.subscriber_count(), "Subscriber added");

        Subscription {
            id,
            rx,
            frames_received: 0,
            frames_lagged: 0,
        }
    }

    /// Deregister a subscriber. Dropping the subscription has the same
    /// effect; this variant logs what the viewer received.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let stats = subscription.stats();
        drop(subscription);

        info!(
            subscriber = stats.id,
            received = stats.frames_received,
            lagged = stats.frames_lagged,
            subscribers = self.subscriber_count(),
            "Subscriber removed"
        );
    }

    /// Stop distributing. Subscribers drain what is already buffered for
    /// them and then observe the end of the stream.
    pub fn close(&self) {
        if self.tx.write().take().is_some() {
            info!("Frame distributor closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }

    /// Get current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx
            .read()
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get statistics about frame distribution
    pub fn stats(&self) -> DistributorStats {
        DistributorStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_unwatched: self.frames_unwatched.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            capacity: self.capacity,
            closed: self.is_closed(),
        }
    }

    /// Log statistics (call periodically for monitoring)
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            sent = stats.frames_sent,
            unwatched = stats.frames_unwatched,
            subscribers = stats.subscribers,
            "Frame distribution stats"
        );
    }
}

/// One viewer's handle on the frame stream.
///
/// Frames arrive in capture order; gaps appear only when this viewer
/// lagged behind and its oldest frames were dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: broadcast::Receiver<Frame>,
    frames_received: u64,
    frames_lagged: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub id: u64,
    pub frames_received: u64,
    pub frames_lagged: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next frame.
    ///
    /// Returns `None` once the distributor is closed and everything
    /// buffered for this subscriber has been delivered.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    self.frames_received += 1;
                    return Some(frame);
                }
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => {
                    debug!(subscriber = self.id, "Frame channel closed");
                    return None;
                }
            }
        }
    }

    /// Take the next buffered frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    self.frames_received += 1;
                    return Some(frame);
                }
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&mut self, n: u64) {
        self.frames_lagged += n;
        warn!(
            subscriber = self.id,
            dropped = n,
            total_dropped = self.frames_lagged,
            "Subscriber lagged, oldest frames dropped"
        );
    }

    /// Get statistics for this subscription
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            id: self.id,
            frames_received: self.frames_received,
            frames_lagged: self.frames_lagged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Bytes::from(format!("frame {}", seq)))
    }

    #[tokio::test]
    async fn test_basic_distribution() {
        let distributor = FrameDistributor::new(10);
        let mut rx1 = distributor.subscribe();
        let mut rx2 = distributor.subscribe();

        assert_eq!(distributor.publish(frame(0)), 2);

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();

        assert_eq!(f1.sequence(), 0);
        assert_eq!(f1.payload(), f2.payload());

        // Both receivers share the payload allocated by the producer
        assert_eq!(f1.payload().as_ptr(), f2.payload().as_ptr());
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_hold_back_others() {
        let distributor = Arc::new(FrameDistributor::new(4));
        let mut stalled = distributor.subscribe();
        let mut fast: Vec<_> = (0..3).map(|_| distributor.subscribe()).collect();

        for seq in 0..20 {
            distributor.publish(frame(seq));
            for rx in fast.iter_mut() {
                let got = timeout(Duration::from_millis(100), rx.recv())
                    .await
                    .expect("fast subscriber must not wait")
                    .unwrap();
                assert_eq!(got.sequence(), seq);
            }
        }

        // The stalled subscriber only holds the newest frames
        let mut held = Vec::new();
        while let Some(f) = stalled.try_recv() {
            held.push(f.sequence());
        }
        assert!(!held.is_empty());
        assert!(held.len() <= 4, "buffer grew to {}", held.len());
        assert_eq!(*held.last().unwrap(), 19);
        assert!(held.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(stalled.stats().frames_lagged as usize, 20 - held.len());
    }

    #[tokio::test]
    async fn test_order_preserved_for_keeping_up_subscriber() {
        let distributor = Arc::new(FrameDistributor::new(128));
        let mut rx = distributor.subscribe();

        let producer = {
            let distributor = distributor.clone();
            tokio::spawn(async move {
                for seq in 0..100 {
                    distributor.publish(frame(seq));
                    tokio::task::yield_now().await;
                }
                distributor.close();
            })
        };

        let mut received = Vec::new();
        while let Some(f) = rx.recv().await {
            received.push(f.sequence());
        }
        producer.await.unwrap();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert_eq!(rx.stats().frames_lagged, 0);
    }

    #[test]
    fn test_capacity_reports_effective_buffer() {
        let distributor = FrameDistributor::new(3);
        assert_eq!(distributor.capacity(), 4);
        assert_eq!(distributor.stats().capacity, 4);

        let mut stalled = distributor.subscribe();
        for seq in 0..10 {
            distributor.publish(frame(seq));
        }

        let held: Vec<_> = std::iter::from_fn(|| stalled.try_recv())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(held, vec![6, 7, 8, 9]);
        assert_eq!(stalled.stats().frames_lagged, 6);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        assert_eq!(FrameDistributor::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_late_join_sees_only_new_frames() {
        let distributor = FrameDistributor::new(8);
        let _early = distributor.subscribe();

        for seq in 0..5 {
            distributor.publish(frame(seq));
        }

        let mut late = distributor.subscribe();
        assert!(late.try_recv().is_none());

        distributor.publish(frame(5));
        assert_eq!(late.recv().await.unwrap().sequence(), 5);
    }

    #[tokio::test]
    async fn test_unsubscribe_then_publish() {
        let distributor = FrameDistributor::new(4);
        let rx1 = distributor.subscribe();
        let mut rx2 = distributor.subscribe();
        assert_eq!(distributor.subscriber_count(), 2);

        distributor.unsubscribe(rx1);
        assert_eq!(distributor.subscriber_count(), 1);
        assert_eq!(distributor.publish(frame(0)), 1);
        assert_eq!(rx2.recv().await.unwrap().sequence(), 0);

        drop(rx2);
        assert_eq!(distributor.subscriber_count(), 0);
        for seq in 1..10 {
            assert_eq!(distributor.publish(frame(seq)), 0);
        }
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let distributor = FrameDistributor::new(10);

        assert_eq!(distributor.publish(frame(0)), 0);

        let stats = distributor.stats();
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.frames_unwatched, 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let distributor = FrameDistributor::new(4);
        let mut rx = distributor.subscribe();

        distributor.publish(frame(0));
        distributor.publish(frame(1));
        distributor.close();

        assert_eq!(rx.recv().await.unwrap().sequence(), 0);
        assert_eq!(rx.recv().await.unwrap().sequence(), 1);
        assert!(rx.recv().await.is_none());

        assert!(distributor.is_closed());
        assert_eq!(distributor.publish(frame(2)), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_is_closed() {
        let distributor = FrameDistributor::new(4);
        distributor.close();

        let mut rx = distributor.subscribe();
        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_publish() {
        let distributor = Arc::new(FrameDistributor::new(4));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let distributor = distributor.clone();
            joins.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let rx = distributor.subscribe();
                    tokio::task::yield_now().await;
                    distributor.unsubscribe(rx);
                }
            }));
        }

        for seq in 0..200 {
            distributor.publish(frame(seq));
            tokio::task::yield_now().await;
        }

        for join in joins {
            join.await.unwrap();
        }
        assert_eq!(distributor.subscriber_count(), 0);
    }
}
