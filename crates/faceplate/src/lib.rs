//! Faceplate binding runtime.
//!
//! The client-side core of a faceplate HMI designer/player: compiles a
//! declarative list of bindings into a minimal dependency graph, evaluates
//! literal/field/script expressions against a remote real-time store,
//! keeps component properties live through targeted push-notification
//! handling (including multi-hop indirection), and serializes UI-triggered
//! write-back actions. Rendering, window chrome, the editor and the wire
//! transport are external collaborators behind the traits in [`store`],
//! [`persistence`] and [`engine::events`].

pub mod engine;
pub mod error;
pub mod persistence;
pub mod script;
pub mod store;
pub mod value;

pub use engine::graph::{
    BindingDefinition, BindingGraph, ExpressionKey, ExpressionMode, TargetKey,
};
pub use engine::{
    BindingRuntime, EventAction, EventHandler, EventPayload, Navigator, RegistrationPhase,
    ValueSource,
};
pub use error::{CompileError, EngineError, RuntimeErrorEntry, ScriptError, StoreError};
pub use persistence::{FaceplateRecord, NotificationChannel, Persistence, ScriptModuleDef};
pub use store::{DataStore, EntityId, FieldPath, MemoryStore, Notification};
pub use value::Value;
