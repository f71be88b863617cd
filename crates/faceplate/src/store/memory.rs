//! In-memory reference store.
//!
//! Backs the integration tests and the CLI. Notifications are delivered
//! synchronously into the registered sinks at write time, which makes
//! subscription behavior fully deterministic under test.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::LocalBoxFuture;
use indexmap::IndexMap;
use tracing::debug;

use super::{
    DataStore, EntityId, FieldPath, FieldType, Notification, NotificationConfig,
    NotificationSink, NotificationSlot, NotificationToken,
};
use crate::error::StoreError;
use crate::value::Value;

struct Subscription {
    config: NotificationConfig,
    sink: NotificationSink,
}

/// Entity/field tables plus live subscriptions.
#[derive(Default)]
pub struct MemoryStore {
    entities: RefCell<IndexMap<EntityId, IndexMap<Arc<str>, Value>>>,
    subscriptions: RefCell<IndexMap<NotificationToken, Subscription>>,
    field_types: RefCell<HashMap<Arc<str>, FieldType>>,
    /// Logical clock stamped onto notification slots.
    clock: Cell<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load entities from a JSON object: `{ "Tank1": { "Level": 7, ... } }`.
    /// Entity references use the `{"$ref": "Tank2"}` convention.
    pub fn load_entities_json(&self, json: &serde_json::Value) -> Result<(), StoreError> {
        let object = json
            .as_object()
            .ok_or_else(|| StoreError::Transport("entity snapshot must be an object".into()))?;
        for (entity, fields) in object {
            let fields = fields.as_object().ok_or_else(|| {
                StoreError::Transport(format!("entity {entity} must be an object"))
            })?;
            self.insert_entity(
                entity.as_str(),
                fields
                    .iter()
                    .map(|(name, value)| (Arc::from(name.as_str()), Value::from_json(value))),
            );
        }
        Ok(())
    }

    pub fn insert_entity(
        &self,
        id: &str,
        fields: impl IntoIterator<Item = (Arc<str>, Value)>,
    ) {
        self.entities
            .borrow_mut()
            .insert(Arc::from(id), fields.into_iter().collect());
    }

    pub fn declare_field_type(&self, field: &str, field_type: FieldType) {
        self.field_types
            .borrow_mut()
            .insert(Arc::from(field), field_type);
    }

    /// Write a single field and deliver notifications to matching
    /// subscriptions. This is the mutation entry tests use to simulate
    /// remote writers.
    pub fn set_field(&self, entity: &str, field: &str, value: Value) {
        let previous = {
            let mut entities = self.entities.borrow_mut();
            let fields = entities.entry(Arc::from(entity)).or_default();
            fields.insert(Arc::from(field), value.clone())
        };
        self.notify(entity, field, previous, value);
    }

    pub fn field_value(&self, entity: &str, field: &str) -> Option<Value> {
        self.entities
            .borrow()
            .get(entity)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    /// Number of live notification registrations; used by leak tests.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    fn notify(&self, entity: &str, field: &str, previous: Option<Value>, current: Value) {
        let timestamp = self.clock.get() + 1;
        self.clock.set(timestamp);

        let sinks: Vec<NotificationSink> = self
            .subscriptions
            .borrow()
            .values()
            .filter(|subscription| {
                let config = &subscription.config;
                if config.entity.as_ref() != entity || config.field.as_ref() != field {
                    return false;
                }
                // trigger-on-change suppresses writes of an unchanged value
                !(config.trigger_on_change && previous.as_ref() == Some(&current))
            })
            .map(|subscription| subscription.sink.clone())
            .collect();

        if sinks.is_empty() {
            return;
        }
        debug!(entity, field, deliveries = sinks.len(), "store push");

        let notification = Notification {
            current: NotificationSlot {
                value: Some(current),
                timestamp: Some(timestamp),
                writer_id: Some("memory-store".into()),
            },
            previous: previous.map(|value| NotificationSlot {
                value: Some(value),
                timestamp: None,
                writer_id: None,
            }),
            context: HashMap::new(),
        };
        for sink in sinks {
            sink.push(notification.clone());
        }
    }

    fn read_direct(&self, entity: &str, field: &str) -> Result<Value, StoreError> {
        let entities = self.entities.borrow();
        let fields = entities
            .get(entity)
            .ok_or_else(|| StoreError::EntityNotFound(Arc::from(entity)))?;
        fields
            .get(field)
            .cloned()
            .ok_or_else(|| StoreError::FieldNotFound {
                entity: Arc::from(entity),
                field: Arc::from(field),
            })
    }

    /// Follow reference hops down to the entity owning the terminal field.
    fn resolve_owner(&self, entity: &EntityId, path: &FieldPath) -> Result<EntityId, StoreError> {
        let mut owner = entity.clone();
        for segment in &path.segments()[..path.segments().len() - 1] {
            match self.read_direct(&owner, segment)? {
                Value::Reference(next) => owner = next,
                _ => {
                    return Err(StoreError::NotAReference {
                        entity: owner,
                        field: segment.clone(),
                    });
                }
            }
        }
        Ok(owner)
    }
}

impl DataStore for MemoryStore {
    fn read<'a>(
        &'a self,
        entity: &'a EntityId,
        path: &'a FieldPath,
    ) -> LocalBoxFuture<'a, Result<Value, StoreError>> {
        Box::pin(async move {
            let owner = self.resolve_owner(entity, path)?;
            self.read_direct(&owner, path.terminal())
        })
    }

    fn write<'a>(
        &'a self,
        entity: &'a EntityId,
        path: &'a FieldPath,
        value: Value,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let owner = self.resolve_owner(entity, path)?;
            self.set_field(&owner, path.terminal(), value);
            Ok(())
        })
    }

    fn register_notification<'a>(
        &'a self,
        config: NotificationConfig,
        sink: NotificationSink,
    ) -> LocalBoxFuture<'a, Result<NotificationToken, StoreError>> {
        Box::pin(async move {
            let token = NotificationToken::new();
            self.subscriptions
                .borrow_mut()
                .insert(token, Subscription { config, sink });
            Ok(token)
        })
    }

    fn unregister_notification<'a>(
        &'a self,
        token: NotificationToken,
    ) -> LocalBoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.subscriptions
                .borrow_mut()
                .shift_remove(&token)
                .map(|_| ())
                .ok_or(StoreError::UnknownSubscription(token.0))
        })
    }

    fn entity_exists<'a>(
        &'a self,
        entity: &'a EntityId,
    ) -> LocalBoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move { Ok(self.entities.borrow().contains_key(entity)) })
    }

    fn field_type<'a>(
        &'a self,
        name: &'a str,
    ) -> LocalBoxFuture<'a, Result<FieldType, StoreError>> {
        Box::pin(async move {
            Ok(self
                .field_types
                .borrow()
                .get(name)
                .copied()
                .unwrap_or(FieldType::Unknown))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_channel::mpsc;

    fn store_with_chain() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_entity(
            "Tank1",
            [
                (Arc::from("Level"), Value::Number(7.0)),
                (Arc::from("Next"), Value::Reference(Arc::from("Tank2"))),
            ],
        );
        store.insert_entity("Tank2", [(Arc::from("Level"), Value::Number(9.0))]);
        store
    }

    #[tokio::test]
    async fn read_follows_reference_chain() {
        let store = store_with_chain();
        let entity: EntityId = Arc::from("Tank1");
        let value = store
            .read(&entity, &FieldPath::parse("Next->Level"))
            .await
            .unwrap();
        assert_eq!(value, Value::Number(9.0));
    }

    #[tokio::test]
    async fn trigger_on_change_suppresses_no_op_writes() {
        let store = store_with_chain();
        let (sender, mut receiver) = mpsc::unbounded();
        let sink = NotificationSink::new(Arc::from("Level"), None, sender);
        store
            .register_notification(
                NotificationConfig {
                    entity: Arc::from("Tank1"),
                    field: Arc::from("Level"),
                    trigger_on_change: true,
                },
                sink,
            )
            .await
            .unwrap();

        store.set_field("Tank1", "Level", Value::Number(7.0));
        assert!(receiver.try_next().is_err(), "unchanged write must not push");

        store.set_field("Tank1", "Level", Value::Number(8.0));
        let event = receiver.try_next().unwrap().unwrap();
        assert_eq!(
            event.notification.current.value,
            Some(Value::Number(8.0))
        );
    }
}
