// =================================================================
// stream/multiplexer.rs - Subscription Registry
// =================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::slot::{Slot, SlotCommand, SlotEvent, SlotKey};
use super::{StreamConfig, StreamError, SubscriptionId, SubscriptionKey};
use crate::exchange::Exchange;

const COMMAND_BUFFER: usize = 256;

enum RegistryCommand {
    Attach {
        id: SubscriptionId,
        key: SubscriptionKey,
        events: mpsc::UnboundedSender<SlotEvent>,
        reply: oneshot::Sender<SlotLink>,
    },
    Detach {
        id: SubscriptionId,
    },
    Slots {
        reply: oneshot::Sender<Vec<SlotKey>>,
    },
}

/// Direct line from a subscription worker to the slot serving it
#[derive(Debug, Clone)]
pub(crate) struct SlotLink {
    commands: mpsc::UnboundedSender<SlotCommand>,
}

impl SlotLink {
    /// Ask the slot to bring this member live again after a backoff
    pub(crate) fn resume(&self, id: SubscriptionId) -> Result<(), StreamError> {
        self.commands
            .send(SlotCommand::Resume { id })
            .map_err(|_| StreamError::MultiplexerClosed)
    }
}

struct SlotEntry {
    commands: mpsc::UnboundedSender<SlotCommand>,
    members: HashSet<SubscriptionId>,
    task: JoinHandle<()>,
}

/// Handle to the registry task that maps subscriptions onto shared slots.
///
/// Slots are spawned on first attach and torn down when their last member
/// detaches. The registry stops once every handle is dropped.
#[derive(Clone)]
pub struct Multiplexer {
    commands: mpsc::Sender<RegistryCommand>,
}

impl Multiplexer {
    /// Spawn the registry task. Must be called inside a Tokio runtime.
    pub fn spawn(exchange: Arc<dyn Exchange>, config: Arc<StreamConfig>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let registry = Registry {
            exchange,
            config,
            slots: HashMap::new(),
            members: HashMap::new(),
        };
        tokio::spawn(registry.run(command_rx));
        Self { commands }
    }

    pub(crate) async fn attach(
        &self,
        id: SubscriptionId,
        key: SubscriptionKey,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Result<SlotLink, StreamError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Attach {
                id,
                key,
                events,
                reply,
            })
            .await
            .map_err(|_| StreamError::MultiplexerClosed)?;
        response.await.map_err(|_| StreamError::MultiplexerClosed)
    }

    pub(crate) async fn detach(&self, id: SubscriptionId) -> Result<(), StreamError> {
        self.commands
            .send(RegistryCommand::Detach { id })
            .await
            .map_err(|_| StreamError::MultiplexerClosed)
    }

    /// Keys of the slots currently alive
    pub async fn slots(&self) -> Result<Vec<SlotKey>, StreamError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(RegistryCommand::Slots { reply })
            .await
            .map_err(|_| StreamError::MultiplexerClosed)?;
        response.await.map_err(|_| StreamError::MultiplexerClosed)
    }

    pub async fn slot_count(&self) -> Result<usize, StreamError> {
        Ok(self.slots().await?.len())
    }
}

struct Registry {
    exchange: Arc<dyn Exchange>,
    config: Arc<StreamConfig>,
    slots: HashMap<SlotKey, SlotEntry>,
    members: HashMap<SubscriptionId, SlotKey>,
}

impl Registry {
    async fn run(mut self, mut commands: mpsc::Receiver<RegistryCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                RegistryCommand::Attach {
                    id,
                    key,
                    events,
                    reply,
                } => {
                    let link = self.attach(id, key, events);
                    let _ = reply.send(link);
                }
                RegistryCommand::Detach { id } => self.detach(id),
                RegistryCommand::Slots { reply } => {
                    let _ = reply.send(self.slots.keys().cloned().collect());
                }
            }
        }

        for (key, entry) in self.slots.drain() {
            let _ = entry.commands.send(SlotCommand::Shutdown);
            debug!("Released slot {} on registry shutdown", key);
        }
        info!("Subscription registry stopped");
    }

    fn attach(
        &mut self,
        id: SubscriptionId,
        key: SubscriptionKey,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> SlotLink {
        let slot_key = SlotKey::for_subscription(self.exchange.as_ref(), &key);

        // A slot whose task died is replaced rather than reused
        if self
            .slots
            .get(&slot_key)
            .map_or(false, |entry| entry.task.is_finished())
        {
            warn!("Slot {} stopped unexpectedly, respawning", slot_key);
            self.slots.remove(&slot_key);
        }

        let entry = self.slots.entry(slot_key.clone()).or_insert_with(|| {
            info!("Opening slot {}", slot_key);
            let (commands, task) = Slot::spawn(
                slot_key.clone(),
                Arc::clone(&self.exchange),
                Arc::clone(&self.config),
            );
            SlotEntry {
                commands,
                members: HashSet::new(),
                task,
            }
        });

        entry.members.insert(id);
        let _ = entry.commands.send(SlotCommand::Join { id, key, events });
        self.members.insert(id, slot_key);

        SlotLink {
            commands: entry.commands.clone(),
        }
    }

    fn detach(&mut self, id: SubscriptionId) {
        let Some(slot_key) = self.members.remove(&id) else {
            return;
        };
        let Some(entry) = self.slots.get_mut(&slot_key) else {
            return;
        };

        entry.members.remove(&id);
        let _ = entry.commands.send(SlotCommand::Leave { id });

        if entry.members.is_empty() {
            let _ = entry.commands.send(SlotCommand::Shutdown);
            self.slots.remove(&slot_key);
            info!("Closed slot {}, no subscribers left", slot_key);
        }
    }
}
