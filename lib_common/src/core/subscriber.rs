//! # Subscriber Stream Adapter
//!
//! Turns bus callbacks into a per-subscriber stream. Each attachment owns an
//! unbounded queue: the bus side never blocks, the consumer side drains at its
//! own pace.
//!
//! On attach the subscriber first receives the current snapshot (one status
//! per known station, plus any pending configuration error), then live
//! events. Detaching, explicitly or by drop, removes every listener before it
//! returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::bus::{BusMessage, Subscription};
use crate::core::upstream_manager::ConnectionManager;
use crate::weather::model::{FRAME_DATA, FRAME_EVENT, FRAME_STATUS};

static NEXT_ATTACHMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A named, serialized frame ready to be written to a push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamFrame {
    /// Event name: `status`, `weather-data` or `weather-event`.
    pub event: &'static str,
    /// JSON body.
    pub data: String,
}

impl DownstreamFrame {
    /// Serializes a bus message. Only fails if a record holds a non-finite
    /// float, which the normalizer never produces.
    pub fn from_message(message: &BusMessage) -> serde_json::Result<Self> {
        match message {
            BusMessage::Status(s) => Self::encode(FRAME_STATUS, s.as_ref()),
            BusMessage::Data(d) => Self::encode(FRAME_DATA, d.as_ref()),
            BusMessage::Event(e) => Self::encode(FRAME_EVENT, e.as_ref()),
        }
    }

    fn encode<T: Serialize>(event: &'static str, record: &T) -> serde_json::Result<Self> {
        Ok(Self {
            event,
            data: serde_json::to_string(record)?,
        })
    }
}

/// One subscriber's view of the bus.
pub struct Attachment {
    id: u64,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    subscriptions: Vec<Subscription>,
}

impl Attachment {
    /// Subscribes to all topics, replaying the snapshot first. Starts the
    /// manager's run loop if it is not running yet.
    pub fn attach(manager: &Arc<ConnectionManager>) -> Self {
        let id = NEXT_ATTACHMENT_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = manager.replay_and_subscribe(move |message| {
            // Receiver gone means the attachment is being dropped.
            let _ = tx.send(message);
        });
        log::debug!("Subscriber {} attached", id);
        Self {
            id,
            rx,
            subscriptions,
        }
    }

    /// Process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, waiting if none is queued. `None` once detached.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Next queued message without waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    /// Removes every listener. Synchronous: nothing is delivered after this.
    pub fn detach(mut self) {
        self.unsubscribe_all();
    }

    fn unsubscribe_all(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        log::debug!("Subscriber {} detached", self.id);
    }

    /// Converts into a stream of downstream frames. Dropping the stream
    /// detaches.
    pub fn into_stream(self) -> impl Stream<Item = DownstreamFrame> + Send + 'static {
        stream::unfold(self, |mut attachment| async move {
            loop {
                let message = attachment.recv().await?;
                match DownstreamFrame::from_message(&message) {
                    Ok(frame) => return Some((frame, attachment)),
                    Err(e) => log::warn!("Dropping unserializable frame for subscriber {}: {}", attachment.id, e),
                }
            }
        })
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upstream_manager::UpstreamConfig;
    use crate::weather::model::{ConnectionStatus, StatusEvent};
    use futures_util::StreamExt;

    fn idle_manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(UpstreamConfig {
            ws_url: "ws://127.0.0.1:9/".into(),
            rest_url: "http://127.0.0.1:9/".into(),
            ..UpstreamConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn detach_removes_every_listener() {
        let manager = idle_manager();
        let mut attachment = Attachment::attach(&manager);
        assert_eq!(manager.bus().listener_count(), 3);

        manager
            .bus()
            .publish_status(StatusEvent::device(1, ConnectionStatus::Connected, None));
        assert!(attachment.try_recv().is_some());

        attachment.detach();
        assert_eq!(manager.bus().listener_count(), 0);
        assert_eq!(
            manager
                .bus()
                .publish_status(StatusEvent::device(1, ConnectionStatus::Error, None)),
            0
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_detaches() {
        let manager = idle_manager();
        let mut frames = Box::pin(Attachment::attach(&manager).into_stream());

        manager
            .bus()
            .publish_status(StatusEvent::device(4, ConnectionStatus::Connected, Some("Deck".into())));
        let frame = frames.next().await.unwrap();
        assert_eq!(frame.event, "status");
        assert_eq!(
            frame.data,
            r#"{"deviceId":4,"status":"connected","label":"Deck"}"#
        );

        drop(frames);
        assert_eq!(manager.bus().listener_count(), 0);
    }

    #[tokio::test]
    async fn each_attachment_gets_its_own_queue() {
        let manager = idle_manager();
        let mut first = Attachment::attach(&manager);
        let mut second = Attachment::attach(&manager);
        assert_ne!(first.id(), second.id());

        manager
            .bus()
            .publish_status(StatusEvent::global(ConnectionStatus::Connected, None));
        assert!(first.try_recv().is_some());
        assert!(second.try_recv().is_some());
        assert!(first.try_recv().is_none());
    }
}
