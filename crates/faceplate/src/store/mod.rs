//! Data-store collaborator interface.
//!
//! The engine never talks to a wire protocol directly; it consumes this
//! trait. Push notifications are delivered through a channel: every
//! subscription carries a [`NotificationSink`] pre-tagged with the dependency
//! name (and hop index for indirect notifiers), and the store clones it per
//! delivery. The runtime drains the single receiving end cooperatively.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_channel::mpsc::UnboundedSender;
use futures_util::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use ulid::Ulid;

use crate::error::StoreError;
use crate::value::Value;

pub mod memory;

pub use memory::MemoryStore;

/// Remote entity identifier.
pub type EntityId = Arc<str>;

/// Delimiter between hops of an indirection path: `Pump->Motor->Speed`.
pub const INDIRECTION_DELIMITER: &str = "->";

/// Ordered field hops from a root entity to a terminal field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: SmallVec<[Arc<str>; 2]>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Self {
        let mut segments: SmallVec<[Arc<str>; 2]> = raw
            .split(INDIRECTION_DELIMITER)
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(Arc::from)
            .collect();
        if segments.is_empty() {
            segments.push(Arc::from(raw.trim()));
        }
        Self { segments }
    }

    pub fn single(field: impl Into<Arc<str>>) -> Self {
        Self {
            segments: SmallVec::from_iter([field.into()]),
        }
    }

    pub fn from_segments(segments: impl IntoIterator<Item = Arc<str>>) -> Self {
        let mut path: SmallVec<[Arc<str>; 2]> = segments.into_iter().collect();
        if path.is_empty() {
            path.push(Arc::from(""));
        }
        Self { segments: path }
    }

    /// A direct path has exactly one hop and maps to a plain subscription.
    pub fn is_direct(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn segments(&self) -> &[Arc<str>] {
        &self.segments
    }

    pub fn terminal(&self) -> &Arc<str> {
        self.segments.last().expect("field path is never empty")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str(INDIRECTION_DELIMITER)?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

/// One slot of a push notification: a value plus its write metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSlot {
    pub value: Option<Value>,
    /// Epoch milliseconds of the write; `None` means "no new data".
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub writer_id: Option<String>,
}

/// On-wire shape of a push notification from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub current: NotificationSlot,
    #[serde(default)]
    pub previous: Option<NotificationSlot>,
    #[serde(default)]
    pub context: HashMap<String, NotificationSlot>,
}

impl Notification {
    /// A null value or timestamp on the current slot means "no new data"
    /// and the notification must be skipped rather than propagated.
    pub fn has_data(&self) -> bool {
        self.current.value.is_some() && self.current.timestamp.is_some()
    }
}

/// Registration request for one field on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub entity: EntityId,
    pub field: Arc<str>,
    pub trigger_on_change: bool,
}

/// Opaque handle returned by `register_notification`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationToken(pub Ulid);

impl NotificationToken {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for NotificationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A push delivery routed back to the engine dispatcher.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Dependency name the subscription was registered for.
    pub dependency: Arc<str>,
    /// Hop index within an indirect notifier; `None` for direct subscriptions.
    pub hop: Option<usize>,
    pub notification: Notification,
}

/// Pre-tagged sending end handed to the store at registration time.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    dependency: Arc<str>,
    hop: Option<usize>,
    sender: UnboundedSender<PushEvent>,
}

impl NotificationSink {
    pub fn new(
        dependency: Arc<str>,
        hop: Option<usize>,
        sender: UnboundedSender<PushEvent>,
    ) -> Self {
        Self {
            dependency,
            hop,
            sender,
        }
    }

    /// Deliver one notification. Delivery after the runtime dropped its
    /// receiver is silently ignored; the subscription is about to be torn
    /// down anyway.
    pub fn push(&self, notification: Notification) {
        let _ = self.sender.unbounded_send(PushEvent {
            dependency: self.dependency.clone(),
            hop: self.hop,
            notification,
        });
    }

    pub fn dependency(&self) -> &Arc<str> {
        &self.dependency
    }
}

/// Declared type of a store field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    Text,
    Bool,
    Reference,
    List,
    Unknown,
}

/// The remote real-time store, as seen by the binding engine.
///
/// Object-safe: every method returns a `LocalBoxFuture` so the runtime can
/// hold the store as `Rc<dyn DataStore>` in its single-threaded world.
pub trait DataStore {
    /// Read a (possibly multi-hop) field path on an entity.
    fn read<'a>(
        &'a self,
        entity: &'a EntityId,
        path: &'a FieldPath,
    ) -> LocalBoxFuture<'a, Result<Value, StoreError>>;

    /// Write a (possibly multi-hop) field path on an entity.
    fn write<'a>(
        &'a self,
        entity: &'a EntityId,
        path: &'a FieldPath,
        value: Value,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>>;

    fn register_notification<'a>(
        &'a self,
        config: NotificationConfig,
        sink: NotificationSink,
    ) -> LocalBoxFuture<'a, Result<NotificationToken, StoreError>>;

    fn unregister_notification<'a>(
        &'a self,
        token: NotificationToken,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>>;

    fn entity_exists<'a>(
        &'a self,
        entity: &'a EntityId,
    ) -> LocalBoxFuture<'a, Result<bool, StoreError>>;

    fn field_type<'a>(&'a self, name: &'a str)
    -> LocalBoxFuture<'a, Result<FieldType, StoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_path_parsing() {
        let direct = FieldPath::parse("Temperature");
        assert!(direct.is_direct());
        assert_eq!(direct.terminal().as_ref(), "Temperature");

        let chain = FieldPath::parse("Pump -> Motor -> Speed");
        assert!(!chain.is_direct());
        assert_eq!(chain.segments().len(), 3);
        assert_eq!(chain.to_string(), "Pump->Motor->Speed");
    }

    #[test]
    fn notification_without_data_is_skipped() {
        let notification = Notification {
            current: NotificationSlot {
                value: Some(Value::Number(1.0)),
                timestamp: None,
                writer_id: None,
            },
            previous: None,
            context: HashMap::new(),
        };
        assert!(!notification.has_data());
    }
}
