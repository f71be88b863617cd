//! End-to-end evaluation behavior against the in-memory store.

use std::rc::Rc;
use std::sync::Arc;

use faceplate::engine::BindingRuntime;
use faceplate::{BindingDefinition, ExpressionMode, MemoryStore, Value};

fn definition(component: &str, property: &str, expression: &str) -> BindingDefinition {
    BindingDefinition {
        component: component.to_string(),
        property: property.to_string(),
        expression: expression.to_string(),
        mode: None,
        transform: None,
        dependencies: Vec::new(),
        description: None,
    }
}

fn tank_store() -> Rc<MemoryStore> {
    let store = Rc::new(MemoryStore::new());
    store.insert_entity(
        "Tank1",
        [
            (Arc::from("Temperature"), Value::Number(42.0)),
            (Arc::from("Level"), Value::Number(70.0)),
            (Arc::from("MaxLevel"), Value::Number(100.0)),
        ],
    );
    store
}

fn runtime(store: &Rc<MemoryStore>) -> BindingRuntime {
    BindingRuntime::new(store.clone() as Rc<dyn faceplate::DataStore>)
}

#[tokio::test]
async fn single_field_binding_evaluates() {
    let store = tank_store();
    let runtime = runtime(&store);
    runtime.build_binding_maps(&[definition("Gauge1", "value", "Temperature")]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), Some(Arc::from("fp-1")))
        .await;

    assert_eq!(
        runtime.binding_value("Gauge1", "value"),
        Value::Number(42.0)
    );
    assert!(runtime.runtime_errors().is_empty());
}

#[tokio::test]
async fn duplicate_expressions_share_one_node_with_fanout() {
    let store = tank_store();
    let runtime = runtime(&store);
    runtime.build_binding_maps(&[
        definition("Gauge1", "value", "Temperature"),
        definition("Gauge2", "value", "Temperature"),
    ]);

    assert_eq!(runtime.expression_count(), 1);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(
        runtime.binding_value("Gauge1", "value"),
        Value::Number(42.0)
    );
    assert_eq!(
        runtime.binding_value("Gauge2", "value"),
        Value::Number(42.0)
    );
}

#[tokio::test]
async fn null_entity_clears_every_slot() {
    let store = tank_store();
    let runtime = runtime(&store);
    runtime.build_binding_maps(&[
        definition("Gauge1", "value", "Temperature"),
        definition("Bar1", "ratio", "Level / MaxLevel"),
    ]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(runtime.binding_value("Bar1", "ratio"), Value::Number(0.7));

    runtime.evaluate_all_bindings(None, None).await;
    assert_eq!(runtime.binding_value("Gauge1", "value"), Value::Null);
    assert_eq!(runtime.binding_value("Bar1", "ratio"), Value::Null);
}

#[tokio::test]
async fn arithmetic_field_expressions_read_multiple_fields() {
    let store = tank_store();
    let runtime = runtime(&store);
    runtime.build_binding_maps(&[definition(
        "Bar1",
        "percent",
        "clamp(Level * 100 / MaxLevel, 0, 100)",
    )]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(
        runtime.binding_value("Bar1", "percent"),
        Value::Number(70.0)
    );
}

#[tokio::test]
async fn literal_bindings_evaluate_without_store_access() {
    let store = Rc::new(MemoryStore::new());
    store.insert_entity("Empty", std::iter::empty::<(Arc<str>, Value)>());
    let runtime = runtime(&store);
    runtime.build_binding_maps(&[
        definition("Label1", "text", "'running'"),
        definition("Label1", "count", "3"),
    ]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Empty")), None)
        .await;
    assert_eq!(runtime.binding_value("Label1", "text"), Value::text("running"));
    assert_eq!(runtime.binding_value("Label1", "count"), Value::Number(3.0));
}

#[tokio::test]
async fn transforms_post_process_raw_values() {
    let store = tank_store();
    let runtime = runtime(&store);
    let mut with_transform = definition("Gauge1", "value", "Temperature");
    with_transform.transform = Some("value => value * 10".to_string());
    runtime.build_binding_maps(&[with_transform]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(
        runtime.binding_value("Gauge1", "value"),
        Value::Number(420.0)
    );
}

#[tokio::test]
async fn failing_transform_falls_back_to_raw_value() {
    let store = tank_store();
    let runtime = runtime(&store);

    let mut broken_compile = definition("Gauge1", "value", "Temperature");
    broken_compile.transform = Some("value => )".to_string());
    let mut broken_runtime = definition("Gauge2", "value", "Temperature");
    broken_runtime.transform = Some("value => value + missing".to_string());
    runtime.build_binding_maps(&[broken_compile, broken_runtime]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;

    // Both slots keep the untransformed value; neither goes blank.
    assert_eq!(
        runtime.binding_value("Gauge1", "value"),
        Value::Number(42.0)
    );
    assert_eq!(
        runtime.binding_value("Gauge2", "value"),
        Value::Number(42.0)
    );
    assert_eq!(runtime.compile_errors().len(), 1);
    assert!(!runtime.runtime_errors().is_empty());
}

#[tokio::test]
async fn script_bindings_use_state_and_cached_fields() {
    let store = tank_store();
    let runtime = runtime(&store);

    let mut script = definition(
        "Trend1",
        "delta",
        "script: let current = getCached(\"Temperature\"); \
         let last = if(getState(\"last\") == null, current, getState(\"last\")); \
         setState(\"last\", current); \
         current - last",
    );
    script.mode = Some(ExpressionMode::Script);
    script.dependencies = vec!["Temperature".to_string()];
    runtime.build_binding_maps(&[definition("Gauge1", "value", "Temperature"), script]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    runtime.register_notifications().await;
    assert_eq!(runtime.binding_value("Trend1", "delta"), Value::Number(0.0));

    // A later push moves the cached value; the script sees the difference.
    store.set_field("Tank1", "Temperature", Value::Number(50.0));
    runtime.process_pending_notifications().await;
    assert_eq!(runtime.binding_value("Trend1", "delta"), Value::Number(8.0));
    assert_eq!(
        runtime.binding_value("Gauge1", "value"),
        Value::Number(50.0)
    );
}

#[tokio::test]
async fn get_cached_on_a_sibling_script_evaluates_it_on_demand() {
    let store = tank_store();
    let runtime = runtime(&store);

    let mut outer = definition("Panel1", "summary", "script: getCached('Level + 0') + 1");
    outer.mode = Some(ExpressionMode::Script);
    let inner = definition("Bar1", "level", "Level + 0");
    runtime.build_binding_maps(&[outer, inner]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(
        runtime.binding_value("Panel1", "summary"),
        Value::Number(71.0)
    );
}

#[tokio::test]
async fn get_cached_on_an_unknown_expression_is_null_without_remote_reads() {
    let store = tank_store();
    let runtime = runtime(&store);

    let mut script = definition("Panel1", "note", "script: getCached('Nothing') == null");
    script.mode = Some(ExpressionMode::Script);
    runtime.build_binding_maps(&[script]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(runtime.binding_value("Panel1", "note"), Value::Bool(true));
}

#[tokio::test]
async fn module_functions_are_callable_from_transforms() {
    let store = tank_store();
    let runtime = runtime(&store);
    runtime.compile_script_modules(&[faceplate::ScriptModuleDef {
        name: "Format".to_string(),
        source: "fn with_unit(v) { formatNumber(v, 0) + \" degC\" }".to_string(),
    }]);

    let mut with_transform = definition("Gauge1", "label", "Temperature");
    with_transform.transform =
        Some("value => Format.with_unit(value)".to_string());
    runtime.build_binding_maps(&[with_transform]);

    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(
        runtime.binding_value("Gauge1", "label"),
        Value::text("42 degC")
    );
}

#[tokio::test]
async fn rebuild_clears_slots_and_script_state() {
    let store = tank_store();
    let runtime = runtime(&store);
    runtime.build_binding_maps(&[definition("Gauge1", "value", "Temperature")]);
    runtime
        .evaluate_all_bindings(Some(Arc::from("Tank1")), None)
        .await;
    assert_eq!(
        runtime.binding_value("Gauge1", "value"),
        Value::Number(42.0)
    );

    runtime.build_binding_maps(&[definition("Other", "value", "Level")]);
    // Replaced wholesale: the old slot set is gone with the old graph.
    assert_eq!(runtime.binding_value("Gauge1", "value"), Value::Null);
}
