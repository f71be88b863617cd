//! Notification/invalidation subsystem.
//!
//! For every distinct dependency in the graph: literals are ignored,
//! single-hop references get a direct subscription, multi-hop reference
//! chains get an indirect notifier that re-subscribes at each hop as
//! intermediate references change and surfaces only terminal-value
//! changes. All pushes funnel through one dispatcher keyed by dependency
//! name, which converts them into targeted recomputation of exactly the
//! dependent expressions.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::sync::Arc;

use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::store::{
    EntityId, FieldPath, NotificationConfig, NotificationSink, NotificationToken, PushEvent,
};
use crate::value::{Value, parse_literal};

use super::BindingRuntime;
use super::graph::{ExpressionKey, ExpressionMode};

/// Registration pass state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPhase {
    Idle,
    CleaningUp,
    Registering,
    Active,
}

#[derive(Debug)]
struct DirectSubscription {
    dependency: Arc<str>,
    token: NotificationToken,
}

#[derive(Debug)]
struct IndirectHop {
    entity: EntityId,
    field: Arc<str>,
    token: NotificationToken,
}

/// An ordered reference-path walk. `hops[i]` watches segment `i` on the
/// entity the previous hop currently resolves to.
#[derive(Debug)]
struct IndirectNotifier {
    path: FieldPath,
    hops: Vec<IndirectHop>,
}

/// Live subscription bookkeeping plus the push channel.
pub struct NotificationState {
    phase: Cell<RegistrationPhase>,
    direct: RefCell<Vec<DirectSubscription>>,
    indirect: RefCell<IndexMap<Arc<str>, IndirectNotifier>>,
    sender: UnboundedSender<PushEvent>,
    receiver: RefCell<UnboundedReceiver<PushEvent>>,
}

impl NotificationState {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            phase: Cell::new(RegistrationPhase::Idle),
            direct: RefCell::new(Vec::new()),
            indirect: RefCell::new(IndexMap::new()),
            sender,
            receiver: RefCell::new(receiver),
        }
    }

    pub fn phase(&self) -> RegistrationPhase {
        self.phase.get()
    }

    /// Total live registrations, direct plus every indirect hop.
    pub fn subscription_count(&self) -> usize {
        self.direct.borrow().len()
            + self
                .indirect
                .borrow()
                .values()
                .map(|notifier| notifier.hops.len())
                .sum::<usize>()
    }
}

impl BindingRuntime {
    pub fn registration_phase(&self) -> RegistrationPhase {
        self.notifications.phase()
    }

    pub fn subscription_count(&self) -> usize {
        self.notifications.subscription_count()
    }

    /// Tear down all existing subscriptions, then register one per distinct
    /// non-literal dependency of the current graph plus the configured
    /// notification-channel fields. Per-dependency failures are logged and
    /// do not stop the remaining registrations.
    pub async fn register_notifications(&self) {
        self.cleanup_notifications().await;

        let Some(entity) = self.bound_entity() else {
            debug!("no entity bound; staying idle");
            return;
        };

        self.notifications.phase.set(RegistrationPhase::Registering);

        let mut dependencies = self.graph().borrow().distinct_dependencies();
        for channel in self.notification_channels() {
            for field in &channel.fields {
                dependencies.insert(Arc::from(field.trim()));
            }
        }

        for dependency in dependencies {
            if parse_literal(&dependency).is_some() {
                trace!(%dependency, "literal dependency skipped");
                continue;
            }
            let path = FieldPath::parse(&dependency);
            let result = if path.is_direct() {
                self.register_direct(&entity, dependency.clone()).await
            } else {
                self.register_indirect(&entity, dependency.clone(), path)
                    .await
            };
            if let Err(error) = result {
                self.errors()
                    .push(format!("register:{dependency}"), error);
            }
        }

        self.notifications.phase.set(RegistrationPhase::Active);
        debug!(
            subscriptions = self.subscription_count(),
            "notification registration complete"
        );
    }

    /// Tear down every direct subscription and indirect notifier, awaiting
    /// each unregistration. Failures are logged and do not block the rest
    /// of the cleanup.
    pub async fn cleanup_notifications(&self) {
        self.notifications.phase.set(RegistrationPhase::CleaningUp);

        let direct = std::mem::take(&mut *self.notifications.direct.borrow_mut());
        for subscription in direct {
            if let Err(error) = self
                .store()
                .unregister_notification(subscription.token)
                .await
            {
                self.errors()
                    .push(format!("cleanup:{}", subscription.dependency), error);
            }
        }

        let indirect = std::mem::take(&mut *self.notifications.indirect.borrow_mut());
        for (dependency, notifier) in indirect {
            for hop in notifier.hops {
                if let Err(error) = self.store().unregister_notification(hop.token).await {
                    self.errors().push(format!("cleanup:{dependency}"), error);
                }
            }
        }

        self.notifications.phase.set(RegistrationPhase::Idle);
    }

    async fn register_direct(
        &self,
        entity: &EntityId,
        dependency: Arc<str>,
    ) -> Result<(), StoreError> {
        let sink =
            NotificationSink::new(dependency.clone(), None, self.notifications.sender.clone());
        let token = self
            .store()
            .register_notification(
                NotificationConfig {
                    entity: entity.clone(),
                    field: dependency.clone(),
                    trigger_on_change: true,
                },
                sink,
            )
            .await?;
        self.notifications
            .direct
            .borrow_mut()
            .push(DirectSubscription { dependency, token });
        Ok(())
    }

    async fn register_indirect(
        &self,
        entity: &EntityId,
        dependency: Arc<str>,
        path: FieldPath,
    ) -> Result<(), StoreError> {
        let mut notifier = IndirectNotifier {
            path,
            hops: Vec::new(),
        };
        let result = self
            .walk_indirect(&dependency, &mut notifier, entity.clone(), 0)
            .await;
        // Track whatever got registered even on a partial walk, so cleanup
        // still reaches those hops.
        self.notifications
            .indirect
            .borrow_mut()
            .insert(dependency, notifier);
        result
    }

    /// Subscribe hops `from_hop..` of a reference chain, starting at
    /// `entity`. Intermediate hops must resolve to entity references.
    async fn walk_indirect(
        &self,
        dependency: &Arc<str>,
        notifier: &mut IndirectNotifier,
        entity: EntityId,
        from_hop: usize,
    ) -> Result<(), StoreError> {
        let segments: Vec<Arc<str>> = notifier.path.segments().to_vec();
        let mut entity = entity;
        for (index, segment) in segments.iter().enumerate().skip(from_hop) {
            let sink = NotificationSink::new(
                dependency.clone(),
                Some(index),
                self.notifications.sender.clone(),
            );
            let token = self
                .store()
                .register_notification(
                    NotificationConfig {
                        entity: entity.clone(),
                        field: segment.clone(),
                        trigger_on_change: true,
                    },
                    sink,
                )
                .await?;
            notifier.hops.push(IndirectHop {
                entity: entity.clone(),
                field: segment.clone(),
                token,
            });

            if index + 1 < segments.len() {
                let value = self
                    .store()
                    .read(&entity, &FieldPath::single(segment.clone()))
                    .await?;
                entity = match value {
                    Value::Reference(next) => next,
                    _ => {
                        return Err(StoreError::NotAReference {
                            entity: entity.clone(),
                            field: segment.clone(),
                        });
                    }
                };
            }
        }
        Ok(())
    }

    /// Drain and dispatch every queued push notification.
    pub async fn process_pending_notifications(&self) {
        loop {
            let event = self.notifications.receiver.borrow_mut().try_next();
            match event {
                Ok(Some(event)) => self.handle_push(event).await,
                // Closed or currently empty either way: nothing to drain.
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn handle_push(&self, event: PushEvent) {
        if !event.notification.has_data() {
            trace!(dependency = %event.dependency, "skipping push without data");
            return;
        }

        if let Some(hop) = event.hop {
            let terminal = self
                .notifications
                .indirect
                .borrow()
                .get(&event.dependency)
                .map(|notifier| hop + 1 == notifier.path.segments().len())
                .unwrap_or(true);
            if !terminal {
                // An intermediate reference changed: re-subscribe the tail
                // of the chain and surface the new terminal value.
                self.rewire_indirect(&event.dependency, hop).await;
                return;
            }
        }

        let value = event
            .notification
            .current
            .value
            .expect("has_data checked above");
        self.dispatch_dependency(&event.dependency, value).await;
    }

    /// Re-walk an indirect notifier from the hop whose reference changed,
    /// then dispatch the fresh terminal value.
    async fn rewire_indirect(&self, dependency: &Arc<str>, hop: usize) {
        let Some(mut notifier) = self
            .notifications
            .indirect
            .borrow_mut()
            .shift_remove(dependency)
        else {
            return;
        };

        // Drop the now-stale downstream subscriptions.
        let stale: Vec<IndirectHop> = notifier
            .hops
            .drain((hop + 1).min(notifier.hops.len())..)
            .collect();
        for old in stale {
            if let Err(error) = self.store().unregister_notification(old.token).await {
                self.errors().push(format!("rewire:{dependency}"), error);
            }
        }

        let outcome = async {
            let changed = notifier
                .hops
                .get(hop)
                .map(|changed| (changed.entity.clone(), changed.field.clone()))
                .ok_or_else(|| StoreError::Transport(format!("unknown hop {hop}")))?;
            let value = self
                .store()
                .read(&changed.0, &FieldPath::single(changed.1.clone()))
                .await?;
            let next = match value {
                Value::Reference(next) => next,
                _ => {
                    return Err(StoreError::NotAReference {
                        entity: changed.0,
                        field: changed.1,
                    });
                }
            };
            self.walk_indirect(dependency, &mut notifier, next, hop + 1)
                .await?;

            let terminal = notifier
                .hops
                .last()
                .expect("walked chain always has a terminal hop");
            self.store()
                .read(&terminal.entity, &FieldPath::single(terminal.field.clone()))
                .await
        }
        .await;

        self.notifications
            .indirect
            .borrow_mut()
            .insert(dependency.clone(), notifier);

        match outcome {
            Ok(value) => self.dispatch_dependency(dependency, value).await,
            Err(error) => self.errors().push(format!("rewire:{dependency}"), error),
        }
    }

    /// Route one dependency's new value to exactly its dependents. A push
    /// for a dependency nothing references falls back to a full pass.
    pub(crate) async fn dispatch_dependency(&self, dependency: &Arc<str>, value: Value) {
        // The pushed value is the freshest raw value of this field; keep
        // the expression cache coherent before dependents re-read it.
        let field_key = ExpressionKey::new(ExpressionMode::Field, dependency);
        self.field_cache()
            .borrow_mut()
            .insert(field_key, value.clone());

        let dependents: Vec<ExpressionKey> = self.graph().borrow().dependents(dependency);
        if dependents.is_empty() {
            warn!(%dependency, "push for unknown dependency; full re-evaluation");
            self.evaluate_all_bindings(self.bound_entity(), None).await;
            return;
        }

        for key in dependents {
            let direct_update = key.mode == ExpressionMode::Field && key.text == *dependency;
            if direct_update {
                // The expression is exactly this field: the pushed value is
                // its raw value, no re-read needed.
                self.update_targets(&key, &value).await;
            } else {
                let guard = RefCell::new(HashSet::new());
                match self.evaluate_one(&key, &guard).await {
                    Ok(evaluated) => self.update_targets(&key, &evaluated).await,
                    Err(error) => self.errors().push(key.to_string(), error),
                }
            }
        }
    }
}
