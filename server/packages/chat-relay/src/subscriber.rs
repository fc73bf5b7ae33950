use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream_event::StreamEvent;

#[derive(Debug, Error)]
#[error("subscriber {0} is closed")]
pub struct SubscriberClosed(pub String);

/// A sink for one session's events, usually one open HTTP stream.
///
/// `send` must not block: it is called while the session's state is locked
/// so that replay and live delivery stay gap-free.
pub trait Subscriber: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn send(&self, event: &StreamEvent) -> Result<(), SubscriberClosed>;
    fn close(&self);
}

/// Subscriber backed by an unbounded channel. Dropping the receiver makes
/// every later `send` fail, which evicts the subscriber.
#[derive(Debug)]
pub struct ChannelSubscriber {
    id: String,
    sender: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: Mutex::new(Some(sender)),
        };
        (subscriber, receiver)
    }
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, event: &StreamEvent) -> Result<(), SubscriberClosed> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) => sender
                .send(event.clone())
                .map_err(|_| SubscriberClosed(self.id.clone())),
            None => Err(SubscriberClosed(self.id.clone())),
        }
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_ends_receiver_and_rejects_sends() {
        let (subscriber, mut receiver) = ChannelSubscriber::new();
        subscriber.send(&StreamEvent::done("m1")).expect("send");
        subscriber.close();

        assert_eq!(receiver.try_recv().ok(), Some(StreamEvent::done("m1")));
        assert!(matches!(
            receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(subscriber.send(&StreamEvent::done("m2")).is_err());
    }

    #[test]
    fn dropped_receiver_fails_send() {
        let (subscriber, receiver) = ChannelSubscriber::new();
        drop(receiver);
        assert!(subscriber.send(&StreamEvent::done("m1")).is_err());
    }
}
