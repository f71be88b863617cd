//! Event action queue.
//!
//! User interactions are applied back to the store strictly in arrival
//! order. One FIFO queue, one drain loop at a time; a handler that fails
//! is logged and the queue keeps draining, so ordering survives failures.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use ulid::Ulid;

use crate::error::{EngineError, EngineResult, ScriptError};
use crate::script::interpreter::{IdentMode, Interpreter, ScriptHost};
use crate::script::parser::{parse_expression, parse_script};
use crate::script::ModuleExports;
use crate::store::{EntityId, FieldPath, FieldType};
use crate::value::Value;

use super::BindingRuntime;

/// Navigation collaborator: resolves a target faceplate (and entity
/// context) outside this engine.
pub trait Navigator {
    fn navigate<'a>(
        &'a self,
        faceplate: &'a str,
        entity: Option<&'a EntityId>,
    ) -> LocalBoxFuture<'a, Result<(), String>>;
}

/// Where a write-field action takes its value from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueSource {
    /// The triggering component's current value.
    #[default]
    Component,
    Literal(Value),
    /// An expression evaluated against the store at event time.
    Expression(String),
}

/// The three event action kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EventAction {
    WriteField {
        field: String,
        #[serde(default)]
        value: ValueSource,
    },
    Script {
        source: String,
    },
    Navigate {
        faceplate: String,
        #[serde(default)]
        entity: Option<ValueSource>,
    },
}

fn default_enabled() -> bool {
    true
}

/// Persisted event handler definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHandler {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub action: EventAction,
    #[serde(default)]
    pub description: Option<String>,
}

/// One queued user interaction.
#[derive(Debug, Clone)]
pub struct EventPayload {
    pub id: Ulid,
    pub trigger: Arc<str>,
    pub handler: EventHandler,
    /// Value associated with the interaction (slider position, input text).
    pub value: Option<Value>,
    pub component: Option<Arc<str>>,
}

impl EventPayload {
    pub fn new(trigger: impl Into<Arc<str>>, handler: EventHandler) -> Self {
        Self {
            id: Ulid::new(),
            trigger: trigger.into(),
            handler,
            value: None,
            component: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_component(mut self, component: impl Into<Arc<str>>) -> Self {
        self.component = Some(component.into());
        self
    }
}

/// FIFO queue plus the re-entrancy guard for its drain loop.
#[derive(Default)]
pub struct EventQueue {
    queue: RefCell<VecDeque<EventPayload>>,
    draining: Cell<bool>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl BindingRuntime {
    /// Enqueue one interaction payload and drain the queue. If a drain
    /// loop is already running further up the call chain, the payload is
    /// only enqueued; the running loop will consume it in order.
    pub async fn handle_event_triggered(&self, payload: EventPayload) {
        self.events.queue.borrow_mut().push_back(payload);
        if self.events.draining.get() {
            trace!("drain loop already running; payload queued");
            return;
        }

        self.events.draining.set(true);
        loop {
            let next = self.events.queue.borrow_mut().pop_front();
            let Some(payload) = next else {
                break;
            };
            if !payload.handler.enabled {
                debug!(trigger = %payload.trigger, "handler disabled; skipped");
                continue;
            }
            if let Err(error) = self.run_event_action(&payload).await {
                self.errors()
                    .push(format!("event:{}", payload.trigger), error);
            }
        }
        self.events.draining.set(false);
    }

    async fn run_event_action(&self, payload: &EventPayload) -> EngineResult<()> {
        match &payload.handler.action {
            EventAction::WriteField { field, value } => {
                let entity = self.bound_entity().ok_or(EngineError::UnboundEntity)?;
                let value = self.resolve_event_value(payload, value).await?;
                let path = FieldPath::parse(field);
                let value = self.coerce_to_field_type(path.terminal(), value).await;
                if path.is_direct() {
                    self.store().write(&entity, &path, value).await?;
                } else {
                    // Indirect write: resolve the reference chain, then
                    // write the terminal field on the owning entity.
                    let owner = self.resolve_write_owner(&entity, &path).await?;
                    self.store()
                        .write(&owner, &FieldPath::single(path.terminal().clone()), value)
                        .await?;
                }
                Ok(())
            }
            EventAction::Script { source } => {
                let context = format!("event:{}", payload.trigger);
                let script = parse_script(source, &context).map_err(EngineError::Script)?;
                let host = EventScriptHost {
                    runtime: self,
                    payload,
                };
                let interpreter = Interpreter::new(&host, IdentMode::Locals);
                interpreter.run(&script).await.map_err(EngineError::Script)?;
                Ok(())
            }
            EventAction::Navigate { faceplate, entity } => {
                let entity = match entity {
                    Some(source) => {
                        let value = self.resolve_event_value(payload, source).await?;
                        match value {
                            Value::Reference(id) => Some(id),
                            Value::Text(id) => Some(id),
                            Value::Null => None,
                            other => {
                                return Err(EngineError::Script(ScriptError::Type(format!(
                                    "navigation entity must be a reference, got {other}"
                                ))));
                            }
                        }
                    }
                    None => self.bound_entity(),
                };
                match self.navigator() {
                    Some(navigator) => navigator
                        .navigate(faceplate, entity.as_ref())
                        .await
                        .map_err(|message| {
                            EngineError::Script(ScriptError::Type(format!(
                                "navigation failed: {message}"
                            )))
                        }),
                    None => {
                        debug!(%faceplate, "no navigator attached; navigation dropped");
                        Ok(())
                    }
                }
            }
        }
    }

    async fn resolve_event_value(
        &self,
        payload: &EventPayload,
        source: &ValueSource,
    ) -> EngineResult<Value> {
        match source {
            ValueSource::Component => Ok(payload.value.clone().unwrap_or(Value::Null)),
            ValueSource::Literal(value) => Ok(value.clone()),
            ValueSource::Expression(expression) => {
                let context = format!("event:{}", payload.trigger);
                let parsed =
                    parse_expression(expression, &context).map_err(EngineError::Script)?;
                let host = EventScriptHost {
                    runtime: self,
                    payload,
                };
                let interpreter = Interpreter::new(&host, IdentMode::Fields);
                interpreter
                    .eval_expression(&parsed)
                    .await
                    .map_err(EngineError::Script)
            }
        }
    }

    /// Align a write value with the field's declared type: text from an
    /// input widget parses into a number field, numbers render into a text
    /// field. Anything else passes through and lets the store decide.
    async fn coerce_to_field_type(&self, field: &Arc<str>, value: Value) -> Value {
        let declared = match self.store().field_type(field).await {
            Ok(declared) => declared,
            Err(_) => return value,
        };
        match (declared, &value) {
            (FieldType::Number, Value::Text(text)) => text
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .unwrap_or(value),
            (FieldType::Text, Value::Number(number)) => Value::text(number.to_string()),
            _ => value,
        }
    }

    /// Follow reference hops to the entity owning the terminal field of a
    /// write path.
    async fn resolve_write_owner(
        &self,
        entity: &EntityId,
        path: &FieldPath,
    ) -> EngineResult<EntityId> {
        let mut owner = entity.clone();
        for segment in &path.segments()[..path.segments().len() - 1] {
            let value = self
                .store()
                .read(&owner, &FieldPath::single(segment.clone()))
                .await?;
            owner = match value {
                Value::Reference(next) => next,
                _ => {
                    return Err(EngineError::Store(crate::error::StoreError::NotAReference {
                        entity: owner,
                        field: segment.clone(),
                    }));
                }
            };
        }
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_json_shape() {
        let handler: EventHandler = serde_json::from_str(
            r#"{ "kind": "writeField", "field": "SetPoint", "value": { "literal": 5 } }"#,
        )
        .unwrap();
        assert!(handler.enabled);
        match handler.action {
            EventAction::WriteField { field, value } => {
                assert_eq!(field, "SetPoint");
                assert!(matches!(value, ValueSource::Literal(Value::Number(n)) if n == 5.0));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn component_value_source_is_the_default() {
        let handler: EventHandler =
            serde_json::from_str(r#"{ "kind": "writeField", "field": "SetPoint" }"#).unwrap();
        match handler.action {
            EventAction::WriteField { value, .. } => {
                assert!(matches!(value, ValueSource::Component));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}

/// Host for event handler scripts and write-field expressions: remote
/// reads, sibling binding values and the event context, but no private
/// state bucket (ad hoc handlers have no expression key).
struct EventScriptHost<'r> {
    runtime: &'r BindingRuntime,
    payload: &'r EventPayload,
}

impl ScriptHost for EventScriptHost<'_> {
    fn get<'a>(&'a self, path: &'a FieldPath) -> LocalBoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move { self.runtime.read_field_cached(path).await })
    }

    fn binding_value(&self, component: &str, property: &str) -> Value {
        self.runtime.binding_value(component, property)
    }

    fn bindings_snapshot(&self) -> Value {
        self.runtime.bindings_snapshot_value()
    }

    fn module(&self, name: &str) -> Option<std::rc::Rc<ModuleExports>> {
        self.runtime.sandbox().module(name)
    }

    fn modules_snapshot(&self) -> Value {
        self.runtime.sandbox().modules_snapshot()
    }

    fn ambient(&self, name: &str) -> Option<Value> {
        match name {
            "value" => Some(self.payload.value.clone().unwrap_or(Value::Null)),
            "trigger" => Some(Value::Text(self.payload.trigger.clone())),
            "component" => Some(
                self.payload
                    .component
                    .clone()
                    .map(Value::Text)
                    .unwrap_or(Value::Null),
            ),
            "entityId" => self.runtime.bound_entity().map(Value::Text),
            "faceplateId" => self.runtime.faceplate_id().map(Value::Text),
            _ => None,
        }
    }
}
