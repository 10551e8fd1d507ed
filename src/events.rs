//! Typed publish/subscribe between the lifecycle hook and entity caches.
//!
//! A channel is the pair (entity kind, [`EventKind`]). Channels are declared
//! once per kind; subscribers run in registration order on the publishing task
//! and a failing subscriber never affects the others.

use crate::error::{Error, Result};
use crate::snapshot::RawSnapshot;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A committed insert or update; carries the new snapshot.
    RawUpsert,
    /// A committed delete; carries only the pk.
    Delete,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::RawUpsert, EventKind::Delete];
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Snapshot(RawSnapshot),
    Deleted,
}

/// One committed change of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub kind: String,
    pub pk: String,
    pub payload: EventPayload,
}

impl CacheEvent {
    pub fn upsert(kind: impl Into<String>, pk: impl Into<String>, snapshot: RawSnapshot) -> Self {
        CacheEvent {
            kind: kind.into(),
            pk: pk.into(),
            payload: EventPayload::Snapshot(snapshot),
        }
    }

    pub fn delete(kind: impl Into<String>, pk: impl Into<String>) -> Self {
        CacheEvent {
            kind: kind.into(),
            pk: pk.into(),
            payload: EventPayload::Deleted,
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Snapshot(_) => EventKind::RawUpsert,
            EventPayload::Deleted => EventKind::Delete,
        }
    }

    pub fn channel(&self) -> Channel {
        Channel::new(self.kind.clone(), self.event_kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub kind: String,
    pub event: EventKind,
}

impl Channel {
    pub fn new(kind: impl Into<String>, event: EventKind) -> Self {
        Channel {
            kind: kind.into(),
            event,
        }
    }
}

/// Receiver of cache events.
pub trait EventSubscriber: Send + Sync {
    fn handle<'a>(&'a self, event: &'a CacheEvent) -> BoxFuture<'a, Result<()>>;
}

/// Adapter turning a synchronous closure into a subscriber.
pub struct FnSubscriber<F>(pub F);

impl<F> EventSubscriber for FnSubscriber<F>
where
    F: Fn(&CacheEvent) -> Result<()> + Send + Sync,
{
    fn handle<'a>(&'a self, event: &'a CacheEvent) -> BoxFuture<'a, Result<()>> {
        async move { (self.0)(event) }.boxed()
    }
}

/// Subscription registry keyed by [`Channel`].
#[derive(Default)]
pub struct EventBus {
    channels: DashMap<Channel, Vec<Arc<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare both channels of an entity kind.
    ///
    /// # Errors
    /// `DuplicateRegistration` if the kind was already declared.
    pub fn declare(&self, kind: &str) -> Result<()> {
        for event in EventKind::ALL {
            match self.channels.entry(Channel::new(kind, event)) {
                Entry::Occupied(_) => {
                    return Err(Error::DuplicateRegistration(format!(
                        "event channels for '{}'",
                        kind
                    )))
                }
                Entry::Vacant(slot) => {
                    slot.insert(Vec::new());
                }
            }
        }
        debug!("Declared event channels for '{}'", kind);
        Ok(())
    }

    pub fn is_declared(&self, kind: &str) -> bool {
        self.channels
            .contains_key(&Channel::new(kind, EventKind::RawUpsert))
    }

    /// Append a subscriber to a declared channel.
    ///
    /// # Errors
    /// `Config` if the channel was never declared.
    pub fn subscribe(
        &self,
        kind: &str,
        event: EventKind,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Result<()> {
        match self.channels.get_mut(&Channel::new(kind, event)) {
            Some(mut subscribers) => {
                subscribers.push(subscriber);
                Ok(())
            }
            None => Err(Error::Config(format!(
                "no event channel declared for '{}' ({:?})",
                kind, event
            ))),
        }
    }

    /// Subscribe a synchronous closure.
    pub fn subscribe_fn<F>(&self, kind: &str, event: EventKind, f: F) -> Result<()>
    where
        F: Fn(&CacheEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(kind, event, Arc::new(FnSubscriber(f)))
    }

    pub fn subscriber_count(&self, kind: &str, event: EventKind) -> usize {
        self.channels
            .get(&Channel::new(kind, event))
            .map_or(0, |s| s.len())
    }

    /// Deliver an event to every subscriber of its channel, in order.
    ///
    /// Failures and panics are logged and skipped. Returns the number of
    /// subscribers that handled the event successfully.
    pub async fn publish(&self, event: &CacheEvent) -> usize {
        // clone the list so no map guard is held across an await
        let subscribers: Vec<Arc<dyn EventSubscriber>> = match self.channels.get(&event.channel()) {
            Some(subscribers) => subscribers.clone(),
            None => {
                debug!("No channel for {} {:?}, event dropped", event.kind, event.event_kind());
                return 0;
            }
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            let delivery = async { subscriber.handle(event).await };
            match AssertUnwindSafe(delivery).catch_unwind().await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => error!(
                    "Subscriber failed on {} {} ({:?}): {}",
                    event.kind,
                    event.pk,
                    event.event_kind(),
                    e
                ),
                Err(_) => error!(
                    "Subscriber panicked on {} {} ({:?})",
                    event.kind,
                    event.pk,
                    event.event_kind()
                ),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(bus: &EventBus, kind: &str, tag: &'static str, log: Arc<Mutex<Vec<String>>>) {
        bus.subscribe_fn(kind, EventKind::RawUpsert, move |event| {
            log.lock().push(format!("{}:{}", tag, event.pk));
            Ok(())
        })
        .expect("subscribe");
    }

    #[tokio::test]
    async fn test_subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        bus.declare("user").expect("declare");
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "user", "first", log.clone());
        recorder(&bus, "user", "second", log.clone());

        let delivered = bus
            .publish(&CacheEvent::upsert("user", "1", RawSnapshot::default()))
            .await;

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock(), vec!["first:1", "second:1"]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let bus = EventBus::new();
        bus.declare("user").expect("declare");
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_fn("user", EventKind::RawUpsert, |_| {
            Err(Error::BackendUnavailable("down".into()))
        })
        .expect("subscribe");
        bus.subscribe_fn("user", EventKind::RawUpsert, |_| panic!("subscriber bug"))
            .expect("subscribe");
        recorder(&bus, "user", "survivor", log.clone());

        let delivered = bus
            .publish(&CacheEvent::upsert("user", "9", RawSnapshot::default()))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(*log.lock(), vec!["survivor:9"]);
    }

    #[tokio::test]
    async fn test_channels_are_separate_per_event_kind() {
        let bus = EventBus::new();
        bus.declare("user").expect("declare");
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "user", "upsert", log.clone());

        let delivered = bus.publish(&CacheEvent::delete("user", "1")).await;
        assert_eq!(delivered, 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_declare_twice_is_rejected() {
        let bus = EventBus::new();
        bus.declare("user").expect("declare");
        assert!(matches!(
            bus.declare("user"),
            Err(Error::DuplicateRegistration(_))
        ));
        assert!(bus.is_declared("user"));
        assert!(!bus.is_declared("order"));
    }

    #[test]
    fn test_subscribe_requires_declared_channel() {
        let bus = EventBus::new();
        let err = bus
            .subscribe_fn("ghost", EventKind::Delete, |_| Ok(()))
            .expect_err("undeclared");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(bus.subscriber_count("ghost", EventKind::Delete), 0);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_channel_is_dropped() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(&CacheEvent::delete("ghost", "1")).await, 0);
    }
}
