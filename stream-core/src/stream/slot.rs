// =================================================================
// stream/slot.rs - Shared Connection Slot
// =================================================================

use std::collections::HashMap;
use std::fmt;
use std::future;
use std::sync::Arc;

use stream_common::data::types::Symbol;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::keepalive::{Watchdog, WatchdogAction};
use super::{FeedKind, MarketEvent, StreamConfig, StreamError, SubscriptionId, SubscriptionKey};
use crate::book::{BookSync, DepthDiff, DepthSnapshot, OrderBookReplica, SyncOutcome};
use crate::exchange::{
    Connection, Decoded, Exchange, ExchangeError, FeedPayload, Inbound, Outbound,
};

/// Identity of one shared exchange connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub endpoint: String,
    pub kind: FeedKind,
    /// Only set when the exchange cannot combine symbols on one connection
    pub symbol: Option<Symbol>,
}

impl SlotKey {
    pub fn for_subscription(exchange: &dyn Exchange, key: &SubscriptionKey) -> Self {
        Self {
            endpoint: exchange.endpoint(key.kind),
            kind: key.kind,
            symbol: (!exchange.supports_combined()).then(|| key.symbol.clone()),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{}[{}:{}]", self.endpoint, self.kind, symbol),
            None => write!(f, "{}[{}]", self.endpoint, self.kind),
        }
    }
}

/// Notifications from a slot to one subscription worker
#[derive(Debug)]
pub(crate) enum SlotEvent {
    /// Route is live; for books the replica is in sync
    Connected,
    ConnectFailed(String),
    /// The exchange refused the route; retrying cannot help
    Rejected(String),
    Data(MarketEvent),
    Book(Arc<OrderBookReplica>),
    /// Route lost, the worker is expected to back off and resume
    Disconnected(StreamError),
    ProtocolError(String),
}

#[derive(Debug)]
pub(crate) enum SlotCommand {
    Join {
        id: SubscriptionId,
        key: SubscriptionKey,
        events: mpsc::UnboundedSender<SlotEvent>,
    },
    Resume {
        id: SubscriptionId,
    },
    Leave {
        id: SubscriptionId,
    },
    Shutdown,
}

struct SnapshotReply {
    stream: String,
    epoch: u64,
    result: Result<DepthSnapshot, ExchangeError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberStatus {
    /// Wants to go live as soon as the route allows
    Waiting,
    Live,
    /// Backing off after a failure, silent until it resumes
    Idle,
}

struct Member {
    stream: String,
    status: MemberStatus,
    events: mpsc::UnboundedSender<SlotEvent>,
}

impl Member {
    fn notify(&self, event: SlotEvent) {
        // A worker that already exited just stops listening
        let _ = self.events.send(event);
    }

    fn go_idle(&mut self, event: SlotEvent) {
        self.notify(event);
        self.status = MemberStatus::Idle;
    }
}

struct Route {
    symbol: Symbol,
    members: usize,
    book: Option<BookSync>,
    subscribed: bool,
    snapshot_inflight: bool,
    /// Bumped on every invalidation so late snapshots are discarded
    epoch: u64,
}

impl Route {
    fn new(key: &SubscriptionKey, max_pending: usize) -> Self {
        let book = match key.kind {
            FeedKind::OrderBook => Some(BookSync::new(key.symbol.clone(), max_pending)),
            _ => None,
        };
        Self {
            symbol: key.symbol.clone(),
            members: 0,
            book,
            subscribed: false,
            snapshot_inflight: false,
            epoch: 0,
        }
    }
}

/// Owner of one exchange connection and every route multiplexed over it.
///
/// Only this task writes to the transport. Subscription workers talk to it
/// through [`SlotCommand`]s and hear back through [`SlotEvent`]s.
pub(crate) struct Slot {
    key: SlotKey,
    exchange: Arc<dyn Exchange>,
    config: Arc<StreamConfig>,
    members: HashMap<SubscriptionId, Member>,
    routes: HashMap<String, Route>,
    connection: Option<Connection>,
    watchdog: Watchdog,
    request_id: u64,
    snapshot_tx: mpsc::UnboundedSender<SnapshotReply>,
}

impl Slot {
    pub(crate) fn spawn(
        key: SlotKey,
        exchange: Arc<dyn Exchange>,
        config: Arc<StreamConfig>,
    ) -> (mpsc::UnboundedSender<SlotCommand>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();

        let slot = Slot {
            key,
            watchdog: Watchdog::new(config.ping_interval, config.pong_timeout),
            exchange,
            config,
            members: HashMap::new(),
            routes: HashMap::new(),
            connection: None,
            request_id: 0,
            snapshot_tx,
        };

        let handle = tokio::spawn(slot.run(command_rx, snapshot_rx));
        (command_tx, handle)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SlotCommand>,
        mut snapshots: mpsc::UnboundedReceiver<SnapshotReply>,
    ) {
        debug!("Slot {} started", self.key);

        loop {
            let deadline = self.watchdog.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(SlotCommand::Join { id, key, events }) => self.join(id, key, events).await,
                    Some(SlotCommand::Resume { id }) => self.resume(id).await,
                    Some(SlotCommand::Leave { id }) => self.leave(id).await,
                    Some(SlotCommand::Shutdown) | None => break,
                },
                frame = next_inbound(&mut self.connection) => self.on_inbound(frame).await,
                Some(reply) = snapshots.recv() => self.on_snapshot_reply(reply),
                _ = sleep_until_deadline(deadline) => self.on_watchdog().await,
            }
        }

        if let Some(connection) = self.connection.take() {
            let _ = connection.outbound.try_send(Outbound::Close);
        }
        info!("Slot {} shut down", self.key);
    }

    async fn join(
        &mut self,
        id: SubscriptionId,
        key: SubscriptionKey,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) {
        let stream = self.exchange.stream_name(&key);
        let max_pending = self.config.max_buffered_diffs;

        let route = self
            .routes
            .entry(stream.clone())
            .or_insert_with(|| Route::new(&key, max_pending));
        route.members += 1;

        debug!("{} joined slot {} on {}", id, self.key, stream);
        self.members.insert(
            id,
            Member {
                stream,
                status: MemberStatus::Waiting,
                events,
            },
        );
        self.activate().await;
    }

    async fn resume(&mut self, id: SubscriptionId) {
        match self.members.get_mut(&id) {
            Some(member) => member.status = MemberStatus::Waiting,
            None => return,
        }
        self.activate().await;
    }

    async fn leave(&mut self, id: SubscriptionId) {
        let Some(member) = self.members.remove(&id) else {
            return;
        };
        debug!("{} left slot {}", id, self.key);

        let emptied = match self.routes.get_mut(&member.stream) {
            Some(route) => {
                route.members = route.members.saturating_sub(1);
                route.members == 0
            }
            None => false,
        };
        if !emptied {
            return;
        }

        let Some(route) = self.routes.remove(&member.stream) else {
            return;
        };
        if route.subscribed && self.connection.is_some() {
            self.request_id += 1;
            let streams = [member.stream];
            match self.exchange.unsubscribe_message(&streams, self.request_id) {
                Ok(message) => {
                    if self.send(Outbound::Text(message)).await {
                        info!("Slot {} unsubscribed from {}", self.key, streams[0]);
                    }
                }
                Err(e) => warn!("Failed to encode unsubscribe for {}: {}", streams[0], e),
            }
        }
    }

    /// Bring waiting members live, connecting first when needed
    async fn activate(&mut self) {
        if !self
            .members
            .values()
            .any(|m| m.status == MemberStatus::Waiting)
        {
            return;
        }

        if self.connection.is_none() {
            if let Err(e) = self.connect().await {
                warn!("Slot {} failed to connect: {}", self.key, e);
                for member in self
                    .members
                    .values_mut()
                    .filter(|m| m.status == MemberStatus::Waiting)
                {
                    member.go_idle(failure_event(&e));
                }
                return;
            }
        }

        if self.subscribe_pending().await {
            self.release_waiting();
        }
    }

    async fn connect(&mut self) -> Result<(), ExchangeError> {
        let exchange = Arc::clone(&self.exchange);
        let endpoint = self.key.endpoint.clone();

        let connection = timeout(self.config.connect_timeout, exchange.open(&endpoint))
            .await
            .map_err(|_| ExchangeError::Timeout)??;

        info!("Slot {} connected", self.key);
        self.connection = Some(connection);
        self.watchdog.arm(Instant::now());
        Ok(())
    }

    /// Send one batched subscribe for every route not yet subscribed
    async fn subscribe_pending(&mut self) -> bool {
        let mut streams: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, route)| !route.subscribed)
            .map(|(stream, _)| stream.clone())
            .collect();
        if streams.is_empty() {
            return true;
        }
        streams.sort();

        self.request_id += 1;
        let message = match self.exchange.subscribe_message(&streams, self.request_id) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to encode subscribe for {:?}: {}", streams, e);
                self.connection_lost(e.to_string());
                return false;
            }
        };

        if !self.send(Outbound::Text(message)).await {
            return false;
        }

        for stream in &streams {
            if let Some(route) = self.routes.get_mut(stream) {
                route.subscribed = true;
            }
        }
        info!("Slot {} subscribed to {:?}", self.key, streams);
        true
    }

    fn release_waiting(&mut self) {
        let pushes_snapshots = self.exchange.pushes_snapshots();
        let mut fetches = Vec::new();

        for member in self
            .members
            .values_mut()
            .filter(|m| m.status == MemberStatus::Waiting)
        {
            let Some(route) = self.routes.get_mut(&member.stream) else {
                continue;
            };

            match route.book.as_ref().map(BookSync::current) {
                None => {
                    member.notify(SlotEvent::Connected);
                    member.status = MemberStatus::Live;
                }
                Some(Some(replica)) => {
                    member.notify(SlotEvent::Connected);
                    member.notify(SlotEvent::Book(replica));
                    member.status = MemberStatus::Live;
                }
                Some(None) => {
                    if !route.snapshot_inflight && !pushes_snapshots {
                        route.snapshot_inflight = true;
                        fetches.push((member.stream.clone(), route.symbol.clone(), route.epoch));
                    }
                }
            }
        }

        for (stream, symbol, epoch) in fetches {
            self.fetch_snapshot(stream, symbol, epoch);
        }
    }

    fn fetch_snapshot(&self, stream: String, symbol: Symbol, epoch: u64) {
        let exchange = Arc::clone(&self.exchange);
        let replies = self.snapshot_tx.clone();
        let depth = self.config.snapshot_depth;

        debug!("Requesting {} snapshot for {}", symbol, stream);
        tokio::spawn(async move {
            let result = exchange.fetch_snapshot(&symbol, depth).await;
            let _ = replies.send(SnapshotReply {
                stream,
                epoch,
                result,
            });
        });
    }

    fn on_snapshot_reply(&mut self, reply: SnapshotReply) {
        let Some(route) = self.routes.get_mut(&reply.stream) else {
            return;
        };
        if route.epoch != reply.epoch {
            debug!("Discarding outdated snapshot for {}", reply.stream);
            return;
        }
        route.snapshot_inflight = false;

        match reply.result {
            Ok(snapshot) => self.apply_snapshot(&reply.stream, snapshot),
            Err(e) => {
                warn!("Snapshot for {} failed: {}", reply.stream, e);
                if e.is_retryable() {
                    self.fail_waiting(&reply.stream, e.to_string());
                } else {
                    self.reject_waiting(&reply.stream, e.to_string());
                }
            }
        }
    }

    fn apply_snapshot(&mut self, stream: &str, snapshot: DepthSnapshot) {
        let outcome = match self.routes.get_mut(stream).and_then(|r| r.book.as_mut()) {
            Some(book) => book.on_snapshot(snapshot),
            None => return,
        };

        match outcome {
            SyncOutcome::Ready(replica) => {
                for member in self.members.values_mut().filter(|m| m.stream == stream) {
                    match member.status {
                        MemberStatus::Waiting => {
                            member.notify(SlotEvent::Connected);
                            member.notify(SlotEvent::Book(Arc::clone(&replica)));
                            member.status = MemberStatus::Live;
                        }
                        MemberStatus::Live => member.notify(SlotEvent::Book(Arc::clone(&replica))),
                        MemberStatus::Idle => {}
                    }
                }
            }
            SyncOutcome::Gap {
                expected,
                first_update_id,
            } => {
                if let Some(route) = self.routes.get_mut(stream) {
                    route.epoch += 1;
                }
                self.fail_waiting(
                    stream,
                    format!(
                        "snapshot behind buffered updates: expected {}, buffered from {}",
                        expected, first_update_id
                    ),
                );
            }
            SyncOutcome::Buffered | SyncOutcome::Applied(_) | SyncOutcome::Stale => {}
        }
    }

    fn fail_waiting(&mut self, stream: &str, reason: String) {
        for member in self
            .members
            .values_mut()
            .filter(|m| m.stream == stream && m.status == MemberStatus::Waiting)
        {
            member.go_idle(SlotEvent::ConnectFailed(reason.clone()));
        }
    }

    fn reject_waiting(&mut self, stream: &str, reason: String) {
        for member in self
            .members
            .values_mut()
            .filter(|m| m.stream == stream && m.status == MemberStatus::Waiting)
        {
            member.go_idle(SlotEvent::Rejected(reason.clone()));
        }
    }

    async fn on_inbound(&mut self, frame: Inbound) {
        match frame {
            Inbound::Text(raw) => {
                self.watchdog.on_liveness(Instant::now());
                match self.exchange.decode(&raw) {
                    Ok(Some(decoded)) => self.dispatch(decoded).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Slot {} dropped undecodable message: {}", self.key, e);
                        let reason = e.to_string();
                        for member in self.live_members(None) {
                            member.notify(SlotEvent::ProtocolError(reason.clone()));
                        }
                    }
                }
            }
            Inbound::Pong => self.watchdog.on_liveness(Instant::now()),
            Inbound::Closed(reason) => {
                warn!("Slot {} lost its connection: {}", self.key, reason);
                self.connection_lost(reason);
            }
        }
    }

    async fn dispatch(&mut self, decoded: Decoded) {
        let Decoded { stream, payload } = decoded;
        if !self.routes.contains_key(&stream) {
            debug!("No route for stream {}", stream);
            return;
        }

        match payload {
            FeedPayload::Ticker(ticker) => self.broadcast(&stream, MarketEvent::Ticker(ticker)),
            FeedPayload::Trade(trade) => self.broadcast(&stream, MarketEvent::Trade(trade)),
            FeedPayload::Kline(kline) => self.broadcast(&stream, MarketEvent::Kline(kline)),
            FeedPayload::Diff(diff) => self.on_diff(&stream, diff).await,
            FeedPayload::Snapshot(snapshot) => {
                if let Some(route) = self.routes.get_mut(&stream) {
                    route.snapshot_inflight = false;
                }
                self.apply_snapshot(&stream, snapshot);
            }
        }
    }

    fn live_members<'a>(&'a self, stream: Option<&'a str>) -> impl Iterator<Item = &'a Member> + 'a {
        self.members.values().filter(move |m| {
            m.status == MemberStatus::Live && stream.map_or(true, |s| m.stream == s)
        })
    }

    fn broadcast(&self, stream: &str, event: MarketEvent) {
        for member in self.live_members(Some(stream)) {
            member.notify(SlotEvent::Data(event.clone()));
        }
    }

    async fn on_diff(&mut self, stream: &str, diff: DepthDiff) {
        let outcome = match self.routes.get_mut(stream).and_then(|r| r.book.as_mut()) {
            Some(book) => book.on_diff(diff),
            None => {
                debug!("Depth update on non-book stream {}", stream);
                return;
            }
        };

        match outcome {
            SyncOutcome::Applied(replica) => {
                for member in self.live_members(Some(stream)) {
                    member.notify(SlotEvent::Book(Arc::clone(&replica)));
                }
            }
            SyncOutcome::Gap {
                expected,
                first_update_id,
            } => self.on_gap(stream, expected, first_update_id).await,
            SyncOutcome::Buffered | SyncOutcome::Stale | SyncOutcome::Ready(_) => {}
        }
    }

    /// Invalidate one book route; the stream subscription is kept when the
    /// exchange serves snapshots over REST
    async fn on_gap(&mut self, stream: &str, expected: u64, first_update_id: u64) {
        let pushes_snapshots = self.exchange.pushes_snapshots();
        let symbol = match self.routes.get_mut(stream) {
            Some(route) => {
                route.epoch += 1;
                route.snapshot_inflight = false;
                if pushes_snapshots {
                    route.subscribed = false;
                }
                route.symbol.to_string()
            }
            None => return,
        };

        let err = StreamError::Gap {
            symbol,
            expected,
            first_update_id,
        };
        for member in self
            .members
            .values_mut()
            .filter(|m| m.stream == stream && m.status != MemberStatus::Idle)
        {
            member.go_idle(SlotEvent::Disconnected(err.clone()));
        }

        if pushes_snapshots {
            // Resubscribing makes the exchange push a fresh snapshot
            self.request_id += 1;
            if let Ok(message) = self
                .exchange
                .unsubscribe_message(&[stream.to_string()], self.request_id)
            {
                self.send(Outbound::Text(message)).await;
            }
        }
    }

    async fn on_watchdog(&mut self) {
        match self.watchdog.poll(Instant::now()) {
            WatchdogAction::SendPing => {
                debug!("Slot {} sending ping", self.key);
                self.send(Outbound::Ping).await;
            }
            WatchdogAction::Unhealthy => {
                warn!(
                    "Slot {} got no pong within {:?}",
                    self.key, self.config.pong_timeout
                );
                self.connection_lost("pong timeout".to_string());
            }
            WatchdogAction::Wait => {}
        }
    }

    async fn send(&mut self, frame: Outbound) -> bool {
        let Some(outbound) = self.connection.as_ref().map(|c| c.outbound.clone()) else {
            return false;
        };
        if outbound.send(frame).await.is_err() {
            self.connection_lost("transport writer closed".to_string());
            return false;
        }
        true
    }

    /// Drop the transport and move every member that was not already backing
    /// off to Idle
    fn connection_lost(&mut self, reason: String) {
        self.connection = None;
        self.watchdog.disarm();

        for route in self.routes.values_mut() {
            route.subscribed = false;
            route.snapshot_inflight = false;
            route.epoch += 1;
            if let Some(book) = route.book.as_mut() {
                book.invalidate();
            }
        }

        let err = StreamError::Disconnected(reason);
        for member in self
            .members
            .values_mut()
            .filter(|m| m.status != MemberStatus::Idle)
        {
            member.go_idle(SlotEvent::Disconnected(err.clone()));
        }
    }
}

async fn next_inbound(connection: &mut Option<Connection>) -> Inbound {
    match connection {
        Some(connection) => connection
            .inbound
            .recv()
            .await
            .unwrap_or_else(|| Inbound::Closed("transport dropped".to_string())),
        None => future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Connect failures worth a retry go through backoff, the rest end the subscription
fn failure_event(err: &ExchangeError) -> SlotEvent {
    if err.is_retryable() {
        SlotEvent::ConnectFailed(err.to_string())
    } else {
        SlotEvent::Rejected(err.to_string())
    }
}
