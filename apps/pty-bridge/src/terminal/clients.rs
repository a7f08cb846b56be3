use std::collections::HashMap;

use metrics::counter;
use relay_proto::Message;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type ClientId = u64;

/// Returned to an attached stream. `evicted` fires when the set drops the
/// client because its queue filled up or its receiver went away.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub evicted: CancellationToken,
}

#[derive(Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub evicted: usize,
}

struct ClientEntry {
    id: ClientId,
    sender: mpsc::Sender<Message>,
    evicted: CancellationToken,
}

/// Streams attached to one terminal for push delivery.
#[derive(Default)]
pub struct ClientSet {
    slab: Slab<ClientEntry>,
    index: HashMap<ClientId, usize>,
    next_id: ClientId,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, sender: mpsc::Sender<Message>) -> ClientHandle {
        self.next_id += 1;
        let id = self.next_id;
        let evicted = CancellationToken::new();
        let key = self.slab.insert(ClientEntry {
            id,
            sender,
            evicted: evicted.clone(),
        });
        self.index.insert(id, key);
        counter!("pty_bridge_clients_attached_total").increment(1);
        ClientHandle { id, evicted }
    }

    pub fn detach(&mut self, id: ClientId) -> bool {
        match self.index.remove(&id) {
            Some(key) => {
                self.slab.remove(key);
                true
            }
            None => false,
        }
    }

    /// Queues `message` for every member. A member whose queue is full or
    /// closed is removed so that it never observes a gap in the sequence.
    pub fn broadcast(&mut self, message: &Message) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let mut failed = Vec::new();

        for (key, entry) in self.slab.iter() {
            match entry.sender.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    failed.push((key, entry.id));
                }
            }
        }

        for (key, id) in failed {
            let entry = self.slab.remove(key);
            self.index.remove(&id);
            entry.evicted.cancel();
            outcome.evicted += 1;
            counter!("pty_bridge_clients_evicted_total").increment(1);
            debug!(client = id, "evicted stream client");
        }

        outcome
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}
