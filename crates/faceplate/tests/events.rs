//! Event action queue: ordering, failure isolation and write-back.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use futures_util::future::LocalBoxFuture;
use faceplate::engine::BindingRuntime;
use faceplate::{
    BindingDefinition, EventAction, EventHandler, EventPayload, MemoryStore, Navigator,
    ValueSource, Value,
};
use faceplate::store::EntityId;

fn handler(action: EventAction) -> EventHandler {
    EventHandler {
        enabled: true,
        action,
        description: None,
    }
}

fn store_with_setpoints() -> Rc<MemoryStore> {
    let store = Rc::new(MemoryStore::new());
    store.insert_entity(
        "Tank1",
        [
            (Arc::from("SetPoint"), Value::Number(10.0)),
            (Arc::from("Temperature"), Value::Number(42.0)),
            (Arc::from("Pump"), Value::Reference(Arc::from("Pump1"))),
        ],
    );
    store.insert_entity("Pump1", [(Arc::from("Speed"), Value::Number(100.0))]);
    store
}

async fn bound_runtime(store: &Rc<MemoryStore>) -> BindingRuntime {
    let runtime = BindingRuntime::new(store.clone() as Rc<dyn faceplate::DataStore>);
    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), Some(Arc::from("fp-1")))
        .await;
    runtime
}

#[derive(Default)]
struct RecordingNavigator {
    visits: RefCell<Vec<String>>,
}

impl Navigator for RecordingNavigator {
    fn navigate<'a>(
        &'a self,
        faceplate: &'a str,
        entity: Option<&'a EntityId>,
    ) -> LocalBoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let entity = entity.map(|id| id.to_string()).unwrap_or_default();
            self.visits.borrow_mut().push(format!("{faceplate}@{entity}"));
            Ok(())
        })
    }
}

#[tokio::test]
async fn write_field_from_component_value() {
    let store = store_with_setpoints();
    let runtime = bound_runtime(&store).await;

    let payload = EventPayload::new(
        "slider.changed",
        handler(EventAction::WriteField {
            field: "SetPoint".to_string(),
            value: ValueSource::Component,
        }),
    )
    .with_component("Slider1")
    .with_value(Value::Number(55.0));
    runtime.handle_event_triggered(payload).await;

    assert_eq!(
        store.field_value("Tank1", "SetPoint"),
        Some(Value::Number(55.0))
    );
    assert!(runtime.runtime_errors().is_empty());
}

#[tokio::test]
async fn write_field_through_a_reference_chain() {
    let store = store_with_setpoints();
    let runtime = bound_runtime(&store).await;

    let payload = EventPayload::new(
        "button.pressed",
        handler(EventAction::WriteField {
            field: "Pump->Speed".to_string(),
            value: ValueSource::Literal(Value::Number(0.0)),
        }),
    );
    runtime.handle_event_triggered(payload).await;

    assert_eq!(
        store.field_value("Pump1", "Speed"),
        Some(Value::Number(0.0))
    );
}

#[tokio::test]
async fn write_field_from_an_evaluated_expression() {
    let store = store_with_setpoints();
    let runtime = bound_runtime(&store).await;

    let payload = EventPayload::new(
        "button.pressed",
        handler(EventAction::WriteField {
            field: "SetPoint".to_string(),
            value: ValueSource::Expression("Temperature + 8".to_string()),
        }),
    );
    runtime.handle_event_triggered(payload).await;

    assert_eq!(
        store.field_value("Tank1", "SetPoint"),
        Some(Value::Number(50.0))
    );
}

#[tokio::test]
async fn write_values_coerce_to_the_declared_field_type() {
    let store = store_with_setpoints();
    store.declare_field_type("SetPoint", faceplate::store::FieldType::Number);
    let runtime = bound_runtime(&store).await;

    let payload = EventPayload::new(
        "input.submitted",
        handler(EventAction::WriteField {
            field: "SetPoint".to_string(),
            value: ValueSource::Literal(Value::text("12.5")),
        }),
    );
    runtime.handle_event_triggered(payload).await;

    assert_eq!(
        store.field_value("Tank1", "SetPoint"),
        Some(Value::Number(12.5))
    );
}

#[tokio::test]
async fn disabled_handlers_are_skipped() {
    let store = store_with_setpoints();
    let runtime = bound_runtime(&store).await;

    let mut disabled = handler(EventAction::WriteField {
        field: "SetPoint".to_string(),
        value: ValueSource::Literal(Value::Number(99.0)),
    });
    disabled.enabled = false;
    runtime
        .handle_event_triggered(EventPayload::new("noop", disabled))
        .await;

    assert_eq!(
        store.field_value("Tank1", "SetPoint"),
        Some(Value::Number(10.0))
    );
}

#[tokio::test]
async fn queue_keeps_draining_in_order_across_failures() {
    let store = store_with_setpoints();
    let navigator = Rc::new(RecordingNavigator::default());
    let runtime = BindingRuntime::new(store.clone() as Rc<dyn faceplate::DataStore>)
        .with_navigator(navigator.clone());
    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;

    let first = EventPayload::new(
        "nav.first",
        handler(EventAction::Navigate {
            faceplate: "overview".to_string(),
            entity: None,
        }),
    );
    // Fails: the expression references an unknown function.
    let failing = EventPayload::new(
        "bad.write",
        handler(EventAction::WriteField {
            field: "SetPoint".to_string(),
            value: ValueSource::Expression("explode(1)".to_string()),
        }),
    );
    let last = EventPayload::new(
        "nav.last",
        handler(EventAction::Navigate {
            faceplate: "detail".to_string(),
            entity: None,
        }),
    );

    runtime.handle_event_triggered(first).await;
    runtime.handle_event_triggered(failing).await;
    runtime.handle_event_triggered(last).await;

    assert_eq!(
        *navigator.visits.borrow(),
        vec!["overview@Tank1".to_string(), "detail@Tank1".to_string()]
    );
    let errors = runtime.runtime_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].context.as_ref(), "event:bad.write");

    // The failing payload was consumed, not re-queued.
    assert_eq!(
        store.field_value("Tank1", "SetPoint"),
        Some(Value::Number(10.0))
    );
}

#[tokio::test]
async fn script_handlers_run_with_event_context() {
    let store = store_with_setpoints();
    let runtime = bound_runtime(&store).await;
    runtime.build_binding_maps(&[BindingDefinition {
        component: "Gauge1".to_string(),
        property: "value".to_string(),
        expression: "Temperature".to_string(),
        mode: None,
        transform: None,
        dependencies: Vec::new(),
        description: None,
    }]);
    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;

    // The handler reads the event value and a sibling binding value.
    let payload = EventPayload::new(
        "ack",
        handler(EventAction::Script {
            source: "let shown = getBindingValue(\"Gauge1\", \"value\"); \
                     if shown != value { explodeIfDifferent(); }"
                .to_string(),
        }),
    )
    .with_value(Value::Number(42.0));
    runtime.handle_event_triggered(payload).await;

    // Values matched, so the poison branch never ran.
    assert!(runtime.runtime_errors().is_empty());
}
