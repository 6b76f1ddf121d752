// =================================================================
// stream/lifecycle.rs - Subscription Handle and Worker
// =================================================================

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{Backoff, BackoffStep};
use super::channel::{channel, ChannelCounters, DataReceiver, Emitter};
use super::multiplexer::{Multiplexer, SlotLink};
use super::slot::SlotEvent;
use super::{
    FeedItem, MarketEvent, StreamConfig, StreamError, StreamState, StreamStats, SubscriptionId,
    SubscriptionKey,
};
use crate::book::OrderBookReplica;

enum HandleState {
    Idle,
    Running {
        stop: CancellationToken,
        task: JoinHandle<()>,
    },
    Closed,
}

/// Resolves once the subscription reaches Closed
#[derive(Debug, Clone)]
pub struct Done {
    state: watch::Receiver<StreamState>,
}

impl Done {
    pub fn is_done(&self) -> bool {
        *self.state.borrow() == StreamState::Closed
    }

    pub async fn wait(mut self) {
        // The sender lives inside the handle, an error means it is gone
        let _ = self.state.wait_for(|s| *s == StreamState::Closed).await;
    }
}

/// One subscription to one market data feed.
///
/// `subscribe` starts a worker task and returns the data channel right away;
/// items flow once the state reaches [`StreamState::Active`]. The handle can
/// be subscribed once. After it closes it stays closed.
pub struct Subscription<T: FeedItem> {
    id: SubscriptionId,
    key: SubscriptionKey,
    config: Arc<StreamConfig>,
    mux: Multiplexer,
    handle: Mutex<HandleState>,
    errors: Mutex<Option<mpsc::Receiver<StreamError>>>,
    state_tx: Arc<watch::Sender<StreamState>>,
    state_rx: watch::Receiver<StreamState>,
    counters: Arc<ChannelCounters>,
    reconnects: Arc<AtomicU64>,
    latest_book: Arc<ArcSwapOption<OrderBookReplica>>,
    _item: PhantomData<fn() -> T>,
}

impl<T: FeedItem> Subscription<T> {
    pub(crate) fn new(
        id: SubscriptionId,
        key: SubscriptionKey,
        config: Arc<StreamConfig>,
        mux: Multiplexer,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        Self {
            id,
            key,
            config,
            mux,
            handle: Mutex::new(HandleState::Idle),
            errors: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            state_rx,
            counters: Arc::new(ChannelCounters::default()),
            reconnects: Arc::new(AtomicU64::new(0)),
            latest_book: Arc::new(ArcSwapOption::empty()),
            _item: PhantomData,
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, HandleState> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start streaming. Cancelling `cancel` closes the subscription.
    pub fn subscribe(&self, cancel: &CancellationToken) -> Result<DataReceiver<T>, StreamError> {
        let mut handle = self.lock_handle();
        match *handle {
            HandleState::Idle => {}
            HandleState::Running { .. } if self.state().is_closed() => {
                return Err(StreamError::Closed)
            }
            HandleState::Running { .. } => return Err(StreamError::AlreadySubscribed),
            HandleState::Closed => return Err(StreamError::Closed),
        }

        let (emitter, receiver, errors) = channel(
            self.config.buffer_size,
            self.config.overflow_policy,
            Arc::clone(&self.counters),
        );
        *self.errors.lock().unwrap_or_else(PoisonError::into_inner) = Some(errors);

        let stop = CancellationToken::new();
        let worker = Worker {
            id: self.id,
            key: self.key.clone(),
            config: Arc::clone(&self.config),
            mux: self.mux.clone(),
            emitter,
            state: Arc::clone(&self.state_tx),
            latest_book: Arc::clone(&self.latest_book),
            reconnects: Arc::clone(&self.reconnects),
            backoff: Backoff::from_config(&self.config),
            cancel: cancel.clone(),
            stop: stop.clone(),
            has_been_active: false,
        };

        info!("Subscribing {} ({})", self.id, self.key);
        let task = tokio::spawn(worker.run());
        *handle = HandleState::Running { stop, task };
        Ok(receiver)
    }

    /// Close the subscription, returning once no further item can be sent.
    ///
    /// Cancelling `ctx` stops the wait early with [`StreamError::Cancelled`];
    /// the worker is already told to stop and still closes on its own.
    pub async fn unsubscribe(&self, ctx: &CancellationToken) -> Result<(), StreamError> {
        let previous = std::mem::replace(&mut *self.lock_handle(), HandleState::Closed);

        match previous {
            HandleState::Running { .. } if self.state().is_closed() => {
                Err(StreamError::NotSubscribed)
            }
            HandleState::Running { stop, task } => {
                info!("Unsubscribing {} ({})", self.id, self.key);
                stop.cancel();
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        warn!("Stopped waiting for {} to close", self.id);
                        Err(StreamError::Cancelled)
                    }
                    joined = task => {
                        if let Err(e) = joined {
                            warn!("Worker for {} ended abnormally: {}", self.id, e);
                        }
                        Ok(())
                    }
                }
            }
            HandleState::Idle => {
                *self.lock_handle() = HandleState::Idle;
                Err(StreamError::NotSubscribed)
            }
            HandleState::Closed => Err(StreamError::NotSubscribed),
        }
    }

    /// Error channel receiver, handed out once per subscribe
    pub fn errors(&self) -> Option<mpsc::Receiver<StreamError>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn done(&self) -> Done {
        Done {
            state: self.state_rx.clone(),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            state: self.state(),
            emitted: self.counters.emitted(),
            dropped: self.counters.dropped(),
            errors_dropped: self.counters.errors_dropped(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Most recent in-sync replica, order-book feeds only
    pub fn latest_book(&self) -> Option<Arc<OrderBookReplica>> {
        self.latest_book.load_full()
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

impl<T: FeedItem> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let HandleState::Running { stop, .. } = &*self.lock_handle() {
            stop.cancel();
        }
    }
}

enum Phase {
    Connecting,
    Active,
    Reconnecting(String),
}

/// Why the worker stops
enum Exit {
    Unsubscribed,
    Cancelled,
    Exhausted { attempts: u32, last_error: String },
    Failed(StreamError),
}

/// Single writer of one subscription's channels
struct Worker<T> {
    id: SubscriptionId,
    key: SubscriptionKey,
    config: Arc<StreamConfig>,
    mux: Multiplexer,
    emitter: Emitter<T>,
    state: Arc<watch::Sender<StreamState>>,
    latest_book: Arc<ArcSwapOption<OrderBookReplica>>,
    reconnects: Arc<AtomicU64>,
    backoff: Backoff,
    cancel: CancellationToken,
    stop: CancellationToken,
    has_been_active: bool,
}

impl<T: FeedItem> Worker<T> {
    async fn run(mut self) {
        self.set_state(StreamState::Connecting);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let exit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => Exit::Unsubscribed,
            _ = self.cancel.cancelled() => Exit::Cancelled,
            attached = self.mux.attach(self.id, self.key.clone(), events_tx) => match attached {
                Ok(slot) => self.drive(&slot, &mut events).await,
                Err(e) => Exit::Failed(e),
            },
        };

        self.finish(exit).await;
    }

    async fn drive(
        &mut self,
        slot: &SlotLink,
        events: &mut mpsc::UnboundedReceiver<SlotEvent>,
    ) -> Exit {
        let mut phase = Phase::Connecting;
        loop {
            let next = match phase {
                Phase::Connecting => self.connecting(events).await,
                Phase::Active => self.active(events).await,
                Phase::Reconnecting(reason) => self.reconnecting(slot, events, reason).await,
            };
            phase = match next {
                Ok(phase) => phase,
                Err(exit) => return exit,
            };
        }
    }

    async fn connecting(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<SlotEvent>,
    ) -> Result<Phase, Exit> {
        self.set_state(StreamState::Connecting);
        let deadline = sleep(self.config.connect_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(Exit::Unsubscribed),
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                event = events.recv() => match event {
                    Some(SlotEvent::Connected) => return Ok(Phase::Active),
                    Some(SlotEvent::ConnectFailed(reason)) => return Ok(Phase::Reconnecting(reason)),
                    Some(SlotEvent::Rejected(reason)) => {
                        return Err(Exit::Failed(StreamError::Rejected(reason)))
                    }
                    Some(SlotEvent::Disconnected(err)) => {
                        return Ok(Phase::Reconnecting(err.to_string()))
                    }
                    Some(other) => debug!("{} ignoring {:?} while connecting", self.id, other),
                    None => return Err(Exit::Failed(StreamError::MultiplexerClosed)),
                },
                _ = &mut deadline => {
                    warn!(
                        "{} not connected within {:?}",
                        self.id, self.config.connect_timeout
                    );
                    return Ok(Phase::Reconnecting("connect timeout".to_string()));
                }
            }
        }
    }

    async fn active(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<SlotEvent>,
    ) -> Result<Phase, Exit> {
        self.backoff.reset();
        if self.has_been_active {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.has_been_active = true;
        self.set_state(StreamState::Active);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(Exit::Unsubscribed),
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                event = events.recv() => match event {
                    Some(SlotEvent::Data(event)) => self.deliver(event),
                    Some(SlotEvent::Book(replica)) => {
                        self.latest_book.store(Some(Arc::clone(&replica)));
                        let book = replica.to_order_book(self.key.depth());
                        self.deliver(MarketEvent::OrderBook(book));
                    }
                    Some(SlotEvent::ProtocolError(reason)) => {
                        self.emitter.emit_error(StreamError::Protocol(reason));
                    }
                    Some(SlotEvent::Disconnected(err)) => {
                        info!("{} lost its feed: {}", self.id, err);
                        self.latest_book.store(None);
                        return Ok(Phase::Reconnecting(err.to_string()));
                    }
                    Some(SlotEvent::ConnectFailed(reason)) => {
                        self.latest_book.store(None);
                        return Ok(Phase::Reconnecting(reason));
                    }
                    Some(SlotEvent::Rejected(reason)) => {
                        return Err(Exit::Failed(StreamError::Rejected(reason)))
                    }
                    Some(SlotEvent::Connected) => {}
                    None => return Err(Exit::Failed(StreamError::MultiplexerClosed)),
                },
            }
        }
    }

    async fn reconnecting(
        &mut self,
        slot: &SlotLink,
        events: &mut mpsc::UnboundedReceiver<SlotEvent>,
        reason: String,
    ) -> Result<Phase, Exit> {
        self.set_state(StreamState::Reconnecting);

        if !self.config.reconnect {
            return Err(Exit::Failed(StreamError::Disconnected(reason)));
        }

        let delay = match self.backoff.next_step() {
            BackoffStep::Retry { attempt, delay } => {
                info!(
                    "{} reconnecting in {:?} (attempt {}): {}",
                    self.id,
                    delay,
                    attempt + 1,
                    reason
                );
                delay
            }
            BackoffStep::Exhausted { attempts } => {
                return Err(Exit::Exhausted {
                    attempts,
                    last_error: reason,
                })
            }
        };

        let wake = sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(Exit::Unsubscribed),
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                _ = &mut wake => break,
                event = events.recv() => {
                    if event.is_none() {
                        return Err(Exit::Failed(StreamError::MultiplexerClosed));
                    }
                    // Anything from before the backoff is stale
                }
            }
        }

        slot.resume(self.id).map_err(Exit::Failed)?;
        Ok(Phase::Connecting)
    }

    fn deliver(&self, event: MarketEvent) {
        if let Some(item) = T::from_event(event) {
            self.emitter.emit(item);
        }
    }

    fn set_state(&self, state: StreamState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{} {} -> {}", self.id, previous, state);
        }
    }

    async fn finish(self, exit: Exit) {
        self.set_state(StreamState::Closing);
        self.latest_book.store(None);

        if let Err(e) = self.mux.detach(self.id).await {
            debug!("{} detach skipped: {}", self.id, e);
        }

        let terminal = match exit {
            Exit::Unsubscribed => None,
            Exit::Cancelled => Some(StreamError::Cancelled),
            Exit::Exhausted {
                attempts,
                last_error,
            } => Some(StreamError::ReconnectExhausted {
                attempts,
                last_error,
            }),
            Exit::Failed(err) => Some(err),
        };
        if let Some(err) = terminal {
            warn!("{} closing: {}", self.id, err);
            self.emitter.emit_error(err);
        }

        let Worker {
            id, emitter, state, ..
        } = self;
        emitter.close();
        state.send_replace(StreamState::Closed);
        info!("{} closed", id);
    }
}
