//! Minimal synchronous publish/subscribe primitive.
//!
//! Handlers are keyed by an exact channel name (no wildcards) and run in
//! registration order on the emitting thread.

use std::collections::HashMap;
use std::fmt;

type Handler<E> = Box<dyn FnMut(&E) + Send>;

/// Token returned by [`EventChannel::on`], used to remove the handler again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct EventChannel<E> {
    handlers: HashMap<String, Vec<(HandlerId, Handler<E>)>>,
    next_id: u64,
}

impl<E> EventChannel<E> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers `handler` under `name`.
    pub fn on<F>(&mut self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(name.into())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Removes a handler. Returns `false` when it was not registered.
    pub fn off(&mut self, name: &str, id: HandlerId) -> bool {
        let Some(handlers) = self.handlers.get_mut(name) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.handlers.remove(name);
        }
        removed
    }

    /// Invokes every handler registered under `name`.
    pub fn emit(&mut self, name: &str, event: &E) {
        if let Some(handlers) = self.handlers.get_mut(name) {
            for (_, handler) in handlers.iter_mut() {
                handler(event);
            }
        }
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.handlers.get(name).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl<E> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(name, handlers)| (name.as_str(), handlers.len()))
            .collect();
        f.debug_struct("EventChannel")
            .field("handlers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::EventChannel;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Arc::clone(&log), log)
    }

    #[test]
    fn emitting_unregistered_name_is_a_no_op() {
        let (log, handle) = recorder();
        let mut channel = EventChannel::<u32>::new();
        channel.on("open", move |value| {
            handle.lock().unwrap().push(format!("open:{value}"));
        });

        channel.emit("close", &1);

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(channel.listener_count("close"), 0);
    }

    #[test]
    fn handlers_fire_once_in_registration_order() {
        let (log, first) = recorder();
        let second = Arc::clone(&log);
        let mut channel = EventChannel::<u32>::new();
        channel.on("message", move |value| {
            first.lock().unwrap().push(format!("first:{value}"));
        });
        channel.on("message", move |value| {
            second.lock().unwrap().push(format!("second:{value}"));
        });

        channel.emit("message", &7);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:7".to_string(), "second:7".to_string()]
        );
    }

    #[test]
    fn removed_handler_no_longer_fires() {
        let (log, first) = recorder();
        let second = Arc::clone(&log);
        let mut channel = EventChannel::<u32>::new();
        let id = channel.on("message", move |_| {
            first.lock().unwrap().push("first".to_string());
        });
        channel.on("message", move |_| {
            second.lock().unwrap().push("second".to_string());
        });

        assert!(channel.off("message", id));
        assert!(!channel.off("message", id));
        channel.emit("message", &0);

        assert_eq!(*log.lock().unwrap(), vec!["second".to_string()]);
        assert_eq!(channel.listener_count("message"), 1);
    }
}
