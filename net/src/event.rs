//! Event publishing from the reactor to subscriber threads.
use crossbeam_channel as chan;

/// The ability to publish state machine events to subscribers.
pub trait Publisher<E>: Send {
    /// Publish an event.
    fn publish(&mut self, event: E);
}

/// Publish events into a channel. Subscribers that have gone away are
/// ignored.
impl<E: Send> Publisher<E> for chan::Sender<E> {
    fn publish(&mut self, event: E) {
        self.send(event).ok();
    }
}
