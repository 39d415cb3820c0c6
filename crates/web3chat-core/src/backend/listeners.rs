use std::sync::Arc;

use parking_lot::RwLock;

use super::{InsertHandler, Unsubscribe};
use crate::envelope::{Envelope, EnvelopeField};
use crate::identity::Identity;

struct Listener {
    id: u64,
    field: EnvelopeField,
    value: Identity,
    handler: InsertHandler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<Listener>,
}

/// Insert-notification fan-out shared by the in-process backends.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        field: EnvelopeField,
        value: Identity,
        handler: InsertHandler,
    ) -> Unsubscribe {
        let id = {
            let mut registry = self.inner.write();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push(Listener {
                id,
                field,
                value,
                handler,
            });
            id
        };

        let weak = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.write().listeners.retain(|l| l.id != id);
            }
        })
    }

    /// Invoke every listener matching `envelope`. Handlers run outside the lock.
    pub fn notify(&self, envelope: &Envelope) {
        let handlers: Vec<InsertHandler> = self
            .inner
            .read()
            .listeners
            .iter()
            .filter(|l| envelope.field(l.field) == &l.value)
            .map(|l| Arc::clone(&l.handler))
            .collect();

        for handler in handlers {
            handler(envelope.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
