//! Typed multi-subscriber notification signals.
//!
//! Subscribers register plain callbacks; `notify` fans an event out to all
//! of them synchronously, in registration order. There is no unsubscribe
//! and no async dispatch.

/// A synchronous one-to-many notification hook.
pub struct Signal<T> {
    slots: Vec<Box<dyn Fn(&T) + Send>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Register a subscriber.
    pub fn connect<F>(&mut self, slot: F)
    where
        F: Fn(&T) + Send + 'static,
    {
        self.slots.push(Box::new(slot));
    }

    /// Invoke every subscriber with the event payload.
    pub fn notify(&self, event: &T) {
        for slot in &self.slots {
            slot(event);
        }
    }

    pub fn num_subscribers(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.slots.len())
            .finish()
    }
}
