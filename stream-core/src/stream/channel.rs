// =================================================================
// stream/channel.rs - Bounded Delivery Channels
// =================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::Stream;
use tokio::sync::{mpsc, Notify};

use super::{OverflowPolicy, StreamError};

/// Fixed capacity of every subscription's error channel
pub const ERROR_BUFFER_SIZE: usize = 10;

/// Delivery counters shared between the emitter and the subscription handle
#[derive(Debug, Default)]
pub struct ChannelCounters {
    emitted: AtomicU64,
    dropped: AtomicU64,
    errors_dropped: AtomicU64,
}

impl ChannelCounters {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn errors_dropped(&self) -> u64 {
        self.errors_dropped.load(Ordering::Relaxed)
    }
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    closed: AtomicBool,
    receiver_alive: AtomicBool,
    receiver_waiting: AtomicBool,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create the data and error channels of one subscription.
///
/// The [`Emitter`] is the only writer. Dropping it closes both channels, so a
/// write after close cannot be expressed.
pub fn channel<T>(
    buffer_size: usize,
    policy: OverflowPolicy,
    counters: Arc<ChannelCounters>,
) -> (Emitter<T>, DataReceiver<T>, mpsc::Receiver<StreamError>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(buffer_size)),
        capacity: buffer_size,
        closed: AtomicBool::new(false),
        receiver_alive: AtomicBool::new(true),
        receiver_waiting: AtomicBool::new(false),
        notify: Notify::new(),
    });
    let (error_tx, error_rx) = mpsc::channel(ERROR_BUFFER_SIZE);

    let emitter = Emitter {
        shared: Arc::clone(&shared),
        errors: error_tx,
        policy,
        counters,
    };

    (emitter, DataReceiver { shared }, error_rx)
}

/// Write half of a subscription's channels
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
    errors: mpsc::Sender<StreamError>,
    policy: OverflowPolicy,
    counters: Arc<ChannelCounters>,
}

impl<T> Emitter<T> {
    /// Non-blocking send. Returns false when the new item was not queued.
    pub fn emit(&self, item: T) -> bool {
        if !self.shared.receiver_alive.load(Ordering::Acquire) {
            return false;
        }

        let mut queue = self.shared.lock();

        if self.shared.capacity == 0 {
            // Unbuffered: hand over only to a consumer already parked in recv
            if self.shared.receiver_waiting.load(Ordering::Acquire) && queue.is_empty() {
                queue.push_back(item);
                drop(queue);
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                self.shared.notify.notify_one();
                return true;
            }
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if queue.len() >= self.shared.capacity {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::DropNewest => return false,
                OverflowPolicy::DropOldest => {
                    queue.pop_front();
                }
            }
        }

        queue.push_back(item);
        drop(queue);
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
        true
    }

    /// Non-blocking error send, silently dropped when the channel is full
    pub fn emit_error(&self, err: StreamError) -> bool {
        match self.errors.try_send(err) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.errors_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_receiver_alive(&self) -> bool {
        self.shared.receiver_alive.load(Ordering::Acquire)
    }

    /// Close both channels; consuming self makes a second close impossible
    pub fn close(self) {
        drop(self);
    }
}

impl<T> Drop for Emitter<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

/// Resets the parked flag even when a pending recv is cancelled
struct WaitingGuard<'a>(&'a AtomicBool);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Receive half of a subscription's data channel
pub struct DataReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> DataReceiver<T> {
    /// Next item, or None once the channel is closed and drained
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut queue = self.shared.lock();
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
                if self.shared.closed.load(Ordering::Acquire) {
                    return None;
                }
                self.shared.receiver_waiting.store(true, Ordering::Release);
            }

            let _guard = WaitingGuard(&self.shared.receiver_waiting);
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the writer is gone; queued items may still be drained
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn into_stream(self) -> impl Stream<Item = T>
    where
        T: Send + 'static,
    {
        futures_util::stream::unfold(self, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

impl<T> Drop for DataReceiver<T> {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn counters() -> Arc<ChannelCounters> {
        Arc::new(ChannelCounters::default())
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_latest_tick() {
        let stats = counters();
        let (emitter, mut rx, _errors) = channel(1, OverflowPolicy::DropOldest, stats.clone());

        assert!(emitter.emit("tick-1"));
        assert!(emitter.emit("tick-2"));

        assert_eq!(rx.len(), 1);
        assert_eq!(rx.recv().await, Some("tick-2"));
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.emitted(), 2);
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_pending_tick() {
        let stats = counters();
        let (emitter, mut rx, _errors) = channel(1, OverflowPolicy::DropNewest, stats.clone());

        assert!(emitter.emit("tick-1"));
        assert!(!emitter.emit("tick-2"));

        assert_eq!(rx.recv().await, Some("tick-1"));
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.emitted(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (emitter, mut rx, mut errors) = channel(4, OverflowPolicy::DropOldest, counters());
        emitter.emit(1);
        emitter.emit(2);
        emitter.emit_error(StreamError::Cancelled);
        emitter.close();

        assert!(rx.is_closed());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
        assert_eq!(errors.recv().await, Some(StreamError::Cancelled));
        assert_eq!(errors.recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_emit_and_close() {
        let (emitter, rx, _errors) = channel(8, OverflowPolicy::DropOldest, counters());

        let consumer = tokio::spawn(async move { rx.into_stream().collect::<Vec<u32>>().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        emitter.emit(7);
        emitter.emit(8);
        emitter.close();

        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_error_channel_drops_on_overflow() {
        let stats = counters();
        let (emitter, _rx, mut errors) = channel::<u8>(1, OverflowPolicy::DropOldest, stats.clone());

        for i in 0..ERROR_BUFFER_SIZE + 3 {
            emitter.emit_error(StreamError::Protocol(format!("bad frame {}", i)));
        }
        assert_eq!(stats.errors_dropped(), 3);

        let first = errors.recv().await.unwrap();
        assert_eq!(first, StreamError::Protocol("bad frame 0".to_string()));
    }

    #[tokio::test]
    async fn test_unbuffered_requires_waiting_consumer() {
        let stats = counters();
        let (emitter, mut rx, _errors) = channel(0, OverflowPolicy::DropOldest, stats.clone());

        // Nobody waiting: dropped
        assert!(!emitter.emit(1));
        assert_eq!(stats.dropped(), 1);

        let consumer = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(emitter.emit(2));
        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Some(2));
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (emitter, rx, _errors) = channel(4, OverflowPolicy::DropOldest, counters());
        drop(rx);
        assert!(!emitter.is_receiver_alive());
        assert!(!emitter.emit(1));
    }
}
