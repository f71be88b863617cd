//! Faceplate record round-trips through the file persistence backend.

use std::rc::Rc;
use std::sync::Arc;

use faceplate::engine::BindingRuntime;
use faceplate::persistence::{FilePersistence, Persistence};
use faceplate::{BindingDefinition, FaceplateRecord, MemoryStore, ScriptModuleDef, Value};

fn sample_record() -> FaceplateRecord {
    serde_json::from_value(serde_json::json!({
        "id": "boiler-overview",
        "name": "Boiler overview",
        "bindings": [
            { "component": "Gauge1", "property": "value", "expression": "Temperature" },
            {
                "component": "Gauge1",
                "property": "color",
                "expression": "Temperature",
                "transform": "value => colorRamp(value / 100, ['#0044ff', '#ff2200'])"
            }
        ],
        "modules": [
            { "name": "Limits", "source": "let max_temp = 100;" }
        ],
        "notification_channels": [
            { "name": "alarms", "fields": ["AlarmState"] }
        ]
    }))
    .expect("sample record deserializes")
}

#[tokio::test]
async fn file_persistence_round_trip() {
    let base = std::env::temp_dir().join(format!("faceplate-test-{}", std::process::id()));
    let persistence = FilePersistence::new(base.clone());

    let record = sample_record();
    persistence.write_faceplate(&record).await.unwrap();
    let loaded = persistence.read_faceplate("boiler-overview").await.unwrap();

    assert_eq!(loaded.id, record.id);
    assert_eq!(loaded.bindings.len(), 2);
    assert_eq!(loaded.modules.len(), 1);
    assert_eq!(loaded.notification_channels[0].fields, vec!["AlarmState"]);

    std::fs::remove_dir_all(base).ok();
}

#[tokio::test]
async fn loaded_record_drives_the_runtime() {
    let store = Rc::new(MemoryStore::new());
    store.insert_entity("Boiler1", [(Arc::from("Temperature"), Value::Number(50.0))]);

    let runtime = BindingRuntime::new(store.clone() as Rc<dyn faceplate::DataStore>);
    runtime.load_faceplate(&sample_record());
    runtime
        .evaluate_all_bindings(Some(Arc::from("Boiler1")), None)
        .await;

    assert_eq!(
        runtime.binding_value("Gauge1", "value"),
        Value::Number(50.0)
    );
    assert_eq!(
        runtime.binding_value("Gauge1", "color"),
        Value::text("#803380")
    );
    assert_eq!(runtime.faceplate_id().as_deref(), Some("boiler-overview"));
}

#[tokio::test]
async fn binding_definitions_deserialize_with_defaults() {
    let definition: BindingDefinition = serde_json::from_str(
        r#"{ "component": "Gauge1", "property": "value", "expression": "42" }"#,
    )
    .unwrap();
    assert!(definition.mode.is_none());
    assert!(definition.transform.is_none());
    assert!(definition.dependencies.is_empty());
}

#[tokio::test]
async fn module_sources_survive_serialization() {
    let module = ScriptModuleDef {
        name: "Limits".to_string(),
        source: "let max_temp = 100;".to_string(),
    };
    let json = serde_json::to_string(&module).unwrap();
    let back: ScriptModuleDef = serde_json::from_str(&json).unwrap();
    assert_eq!(back.name, "Limits");
    assert_eq!(back.source, "let max_temp = 100;");
}
