use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Receives completed messages for a routing key. Handlers are called on the endpoint's
///  receive loop, so a handler that takes long delays all further receiving on that endpoint.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, sender_addr: SocketAddr, msg_buf: &[u8]);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(SocketAddr, &[u8]) + Send + Sync + 'static,
{
    async fn on_message(&self, sender_addr: SocketAddr, msg_buf: &[u8]) {
        self(sender_addr, msg_buf)
    }
}

type HandlerId = u64;

#[derive(Default)]
struct Handlers {
    by_key: FxHashMap<i32, Vec<(HandlerId, Arc<dyn MessageHandler>)>>,
}

/// Maps routing keys to handlers, in registration order per key.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<Handlers>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        Default::default()
    }

    pub fn register(self: &Arc<Self>, routing_key: i32, handler: Arc<dyn MessageHandler>) -> HandlerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!("registering handler #{} for routing key {}", id, routing_key);

        self.handlers.lock().unwrap()
            .by_key
            .entry(routing_key)
            .or_default()
            .push((id, handler));

        HandlerRegistration {
            registry: Arc::downgrade(self),
            routing_key,
            id,
        }
    }

    fn unregister(&self, routing_key: i32, id: HandlerId) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(list) = handlers.by_key.get_mut(&routing_key) {
            list.retain(|(h, _)| *h != id);
            if list.is_empty() {
                handlers.by_key.remove(&routing_key);
            }
        }
    }

    /// A snapshot of the handlers for a routing key. Dispatching works on the snapshot, so
    ///  handlers can (un)register concurrently - a handler removed during dispatch may still
    ///  receive the message that is being dispatched.
    pub fn handlers_for(&self, routing_key: i32) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.lock().unwrap()
            .by_key
            .get(&routing_key)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn dispatch(&self, routing_key: i32, sender_addr: SocketAddr, msg_buf: &[u8]) -> usize {
        let handlers = self.handlers_for(routing_key);
        if handlers.is_empty() {
            trace!("no handler registered for routing key {} - dropping message", routing_key);
        }
        for handler in &handlers {
            handler.on_message(sender_addr, msg_buf).await;
        }
        handlers.len()
    }
}

/// Unregisters its handler when dropped (or explicitly via [HandlerRegistration::unregister]).
///  Only the handler that was registered with this token is removed, other handlers for the
///  same routing key stay in place.
#[must_use = "the handler is unregistered when the registration is dropped"]
pub struct HandlerRegistration {
    registry: Weak<HandlerRegistry>,
    routing_key: i32,
    id: HandlerId,
}

impl HandlerRegistration {
    #[cfg(test)]
    pub fn routing_key(&self) -> i32 {
        self.routing_key
    }

    pub fn unregister(self) {}
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.routing_key, self.id);
        }
    }
}
