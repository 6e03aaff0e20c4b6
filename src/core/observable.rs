//! Subject/observer primitive used by the device monitors.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Receives the events published by an [`ObservableRegistry`].
pub trait Observer<E>: Send + Sync {
    /// Called synchronously on the publishing thread. An error stops the
    /// delivery and is handed back to the publisher.
    fn update(&self, event: &E) -> anyhow::Result<()>;
}

impl<E, F> Observer<E> for F
where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync,
{
    fn update(&self, event: &E) -> anyhow::Result<()> {
        self(event)
    }
}

/// Observers are identified by the allocation they live in.
pub fn same_observer<E>(a: &Arc<dyn Observer<E>>, b: &Arc<dyn Observer<E>>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Ordered observer set plus a "changed" flag.
pub struct ObservableRegistry<E> {
    observers: Vec<Arc<dyn Observer<E>>>,
    changed: bool,
}

impl<E> Default for ObservableRegistry<E> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
            changed: false,
        }
    }
}

impl<E> ObservableRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` unless it is already there. Returns whether it was added.
    pub fn add_observer(&mut self, observer: Arc<dyn Observer<E>>) -> bool {
        if self.contains(&observer) {
            return false;
        }
        self.observers.push(observer);
        true
    }

    /// Returns whether `observer` was registered.
    pub fn remove_observer(&mut self, observer: &Arc<dyn Observer<E>>) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| !same_observer(o, observer));
        self.observers.len() != before
    }

    pub fn contains(&self, observer: &Arc<dyn Observer<E>>) -> bool {
        self.observers.iter().any(|o| same_observer(o, observer))
    }

    pub fn delete_observers(&mut self) {
        self.observers.clear();
    }

    pub fn count_observers(&self) -> usize {
        self.observers.len()
    }

    pub fn observers(&self) -> &[Arc<dyn Observer<E>>] {
        &self.observers
    }

    pub fn set_changed(&mut self) {
        self.changed = true;
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Deliver `event` to every observer in registration order if the
    /// registry is marked changed, then clear the mark.
    pub fn notify(&mut self, event: &E) -> anyhow::Result<()> {
        for observer in self.take_pending() {
            observer.update(event)?;
        }
        Ok(())
    }

    /// Clear the changed mark and hand out the observers to notify, so the
    /// caller can deliver after releasing whatever lock guards the registry.
    /// Empty when nothing changed.
    pub fn take_pending(&mut self) -> Vec<Arc<dyn Observer<E>>> {
        if !self.changed {
            return Vec::new();
        }
        self.changed = false;
        self.observers.clone()
    }
}

/// Observer forwarding every event into a channel, for consumers that
/// prefer reading events on their own thread.
pub struct ChannelObserver<E> {
    sender: Sender<E>,
}

impl<E> ChannelObserver<E> {
    pub fn new(sender: Sender<E>) -> Self {
        Self { sender }
    }
}

impl<E> Observer<E> for ChannelObserver<E>
where
    E: Clone + Send,
{
    fn update(&self, event: &E) -> anyhow::Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}

/// Create an observer together with the receiving end of its queue.
pub fn event_channel<E>() -> (Arc<ChannelObserver<E>>, Receiver<E>) {
    let (sender, receiver) = unbounded();
    (Arc::new(ChannelObserver::new(sender)), receiver)
}
