//! Evaluation engine and the public runtime surface.
//!
//! [`BindingRuntime`] owns the binding graph, the value slots and caches,
//! the script sandbox, the notification registrations and the event action
//! queue. It is a single-threaded cooperative component: "concurrency"
//! means multiple outstanding store calls interleaved on one thread, so
//! interior state lives in `RefCell`s and no borrow is ever held across an
//! await point.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::StreamExt;
use futures_util::future::LocalBoxFuture;
use futures_util::stream;
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult, ErrorLog, RuntimeErrorEntry, ScriptError};
use crate::persistence::{FaceplateRecord, NotificationChannel};
use crate::script::ast::{Expr, TransformDef};
use crate::script::interpreter::{IdentMode, Interpreter, ScriptHost};
use crate::script::parser::parse_expression;
use crate::script::{ModuleExports, ScriptSandbox, Spanned};
use crate::store::{DataStore, EntityId, FieldPath};
use crate::value::{Value, parse_literal};

pub mod events;
pub mod graph;
pub mod notify;
pub mod transform;

use events::EventQueue;
use graph::{BindingGraph, BindingDefinition, BindingTarget, ExpressionKey, ExpressionMode, TargetKey};
use notify::NotificationState;
use transform::TransformCache;

pub use events::{EventAction, EventHandler, EventPayload, Navigator, ValueSource};
pub use notify::RegistrationPhase;

/// Cap on expressions evaluated concurrently in one full pass.
const MAX_CONCURRENT_EVALUATIONS: usize = 16;

/// Currently bound evaluation context.
#[derive(Debug, Default, Clone)]
pub struct BindingContext {
    pub entity_id: Option<EntityId>,
    pub faceplate_id: Option<Arc<str>>,
}

/// The binding evaluation runtime for one loaded faceplate.
pub struct BindingRuntime {
    store: Rc<dyn DataStore>,
    navigator: Option<Rc<dyn Navigator>>,
    graph: RefCell<BindingGraph>,
    /// Binding value slots, keyed `component:property`. Initialized to null,
    /// never removed during a session, cleared on graph rebuild.
    slots: RefCell<IndexMap<TargetKey, Value>>,
    /// Expression value cache: last raw value per field-mode expression key.
    field_cache: RefCell<HashMap<ExpressionKey, Value>>,
    /// Parsed field-mode arithmetic expressions, keyed by normalized text.
    field_expressions: RefCell<HashMap<Arc<str>, Rc<Spanned<Expr>>>>,
    component_touched: RefCell<HashMap<Arc<str>, SystemTime>>,
    sandbox: ScriptSandbox,
    transforms: TransformCache,
    errors: ErrorLog,
    context: RefCell<BindingContext>,
    channels: RefCell<Vec<NotificationChannel>>,
    pub(crate) notifications: NotificationState,
    pub(crate) events: EventQueue,
}

impl BindingRuntime {
    pub fn new(store: Rc<dyn DataStore>) -> Self {
        Self {
            store,
            navigator: None,
            graph: RefCell::new(BindingGraph::default()),
            slots: RefCell::new(IndexMap::new()),
            field_cache: RefCell::new(HashMap::new()),
            field_expressions: RefCell::new(HashMap::new()),
            component_touched: RefCell::new(HashMap::new()),
            sandbox: ScriptSandbox::new(),
            transforms: TransformCache::new(),
            errors: ErrorLog::default(),
            context: RefCell::new(BindingContext::default()),
            channels: RefCell::new(Vec::new()),
            notifications: NotificationState::new(),
            events: EventQueue::new(),
        }
    }

    pub fn with_navigator(mut self, navigator: Rc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub(crate) fn store(&self) -> &Rc<dyn DataStore> {
        &self.store
    }

    pub(crate) fn navigator(&self) -> Option<&Rc<dyn Navigator>> {
        self.navigator.as_ref()
    }

    pub(crate) fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub(crate) fn sandbox(&self) -> &ScriptSandbox {
        &self.sandbox
    }

    /// Compile (or recompile) the shared script modules.
    pub fn compile_script_modules(&self, modules: &[crate::persistence::ScriptModuleDef]) {
        self.sandbox.compile_modules(modules);
    }

    /// Load one faceplate record wholesale: compile its script modules,
    /// adopt its notification channels and rebuild the binding maps.
    pub fn load_faceplate(&self, record: &FaceplateRecord) {
        self.sandbox.compile_modules(&record.modules);
        *self.channels.borrow_mut() = record.notification_channels.clone();
        self.context.borrow_mut().faceplate_id = Some(Arc::from(record.id.as_str()));
        self.build_binding_maps(&record.bindings);
    }

    /// Compile binding definitions into the graph and reset per-graph
    /// state: value slots, expression cache, compiled scripts and script
    /// state buckets.
    pub fn build_binding_maps(&self, definitions: &[BindingDefinition]) {
        let graph = BindingGraph::build(definitions);

        let mut slots = self.slots.borrow_mut();
        slots.clear();
        for targets in graph.targets.values() {
            for target in targets {
                slots
                    .entry(TargetKey::new(
                        target.component.clone(),
                        target.property.clone(),
                    ))
                    .or_insert(Value::Null);
            }
        }
        drop(slots);

        self.field_cache.borrow_mut().clear();
        self.field_expressions.borrow_mut().clear();
        self.sandbox.clear();
        *self.graph.borrow_mut() = graph;
    }

    /// Evaluate every distinct expression and fan results out to the
    /// binding value slots. With no entity bound, every slot and cache
    /// entry is nulled instead: an unbound faceplate shows no data.
    pub async fn evaluate_all_bindings(
        &self,
        entity_id: Option<EntityId>,
        faceplate_id: Option<Arc<str>>,
    ) {
        {
            let mut context = self.context.borrow_mut();
            if context.entity_id != entity_id {
                // Cached raw values belong to the previous entity.
                self.field_cache.borrow_mut().clear();
            }
            context.entity_id = entity_id.clone();
            if faceplate_id.is_some() {
                context.faceplate_id = faceplate_id;
            }
        }

        let Some(entity) = entity_id else {
            self.clear_values();
            debug!("no entity bound; slots cleared");
            return;
        };

        match self.store.entity_exists(&entity).await {
            Ok(true) => {}
            Ok(false) => {
                self.errors
                    .push("evaluate", format!("entity {entity} does not exist"));
                self.clear_values();
                return;
            }
            // A transport hiccup on the existence probe is not fatal; the
            // per-expression reads will surface their own failures.
            Err(error) => debug!(%error, "entity existence probe failed"),
        }

        let keys: Vec<ExpressionKey> = self.graph.borrow().metadata.keys().cloned().collect();
        trace!(expressions = keys.len(), "full evaluation pass");

        let mut passes = stream::iter(keys)
            .map(|key| async move {
                let guard = RefCell::new(HashSet::new());
                let result = self.evaluate_one(&key, &guard).await;
                (key, result)
            })
            .buffer_unordered(MAX_CONCURRENT_EVALUATIONS);

        while let Some((key, result)) = passes.next().await {
            match result {
                Ok(value) => self.update_targets(&key, &value).await,
                Err(error) => self.errors.push(key.to_string(), error),
            }
        }
    }

    fn clear_values(&self) {
        for slot in self.slots.borrow_mut().values_mut() {
            *slot = Value::Null;
        }
        for cached in self.field_cache.borrow_mut().values_mut() {
            *cached = Value::Null;
        }
    }

    /// Evaluate one expression by its key. The recursion guard carries the
    /// keys currently being evaluated in this call chain; re-entering one
    /// is a cycle error, not an infinite loop.
    pub(crate) fn evaluate_one<'a>(
        &'a self,
        key: &'a ExpressionKey,
        guard: &'a RefCell<HashSet<ExpressionKey>>,
    ) -> LocalBoxFuture<'a, EngineResult<Value>> {
        Box::pin(async move {
            if !guard.borrow_mut().insert(key.clone()) {
                return Err(EngineError::Cycle(key.to_string()));
            }
            let result = self.evaluate_one_inner(key, guard).await;
            guard.borrow_mut().remove(key);
            result
        })
    }

    async fn evaluate_one_inner(
        &self,
        key: &ExpressionKey,
        guard: &RefCell<HashSet<ExpressionKey>>,
    ) -> EngineResult<Value> {
        match key.mode {
            ExpressionMode::Literal => {
                parse_literal(&key.text).ok_or_else(|| EngineError::InvalidLiteral(key.text.clone()))
            }
            ExpressionMode::Field => {
                let value = self.resolve_field_expression(&key.text).await?;
                self.field_cache
                    .borrow_mut()
                    .insert(key.clone(), value.clone());
                Ok(value)
            }
            ExpressionMode::Script => {
                let key_id = key.id();
                let script = self.sandbox.compiled_script(&key_id, &key.text)?;
                let host = BindingScriptHost {
                    runtime: self,
                    key_id,
                    guard,
                };
                let interpreter = Interpreter::new(&host, IdentMode::Locals);
                Ok(interpreter.run(&script).await?)
            }
        }
    }

    /// Field-mode evaluation: a bare path is a direct store read; anything
    /// else is a small arithmetic expression whose identifiers resolve as
    /// store fields.
    async fn resolve_field_expression(&self, text: &Arc<str>) -> EngineResult<Value> {
        if graph::is_bare_path(text) {
            let entity = self.bound_entity().ok_or(EngineError::UnboundEntity)?;
            let value = self.store.read(&entity, &FieldPath::parse(text)).await?;
            return Ok(value);
        }

        let expression = {
            let cached = self.field_expressions.borrow().get(text).cloned();
            match cached {
                Some(expression) => expression,
                None => {
                    let parsed = Rc::new(parse_expression(text, text)?);
                    self.field_expressions
                        .borrow_mut()
                        .insert(text.clone(), parsed.clone());
                    parsed
                }
            }
        };

        let host = FieldExpressionHost { runtime: self };
        let interpreter = Interpreter::new(&host, IdentMode::Fields);
        Ok(interpreter.eval_expression(&expression).await?)
    }

    /// Write one expression's value to all of its binding targets. The
    /// whole fan-out is written together after every transform has run;
    /// no suspension point sits between the slot writes.
    pub(crate) async fn update_targets(&self, key: &ExpressionKey, raw: &Value) {
        let targets: Vec<BindingTarget> = self
            .graph
            .borrow()
            .targets
            .get(key)
            .cloned()
            .unwrap_or_default();

        let mut writes = Vec::with_capacity(targets.len());
        for target in &targets {
            let value = match &target.transform {
                Some(source) => self.apply_transform(target, key, source, raw).await,
                None => raw.clone(),
            };
            writes.push((
                TargetKey::new(target.component.clone(), target.property.clone()),
                value,
            ));
        }

        let now = SystemTime::now();
        let mut slots = self.slots.borrow_mut();
        let mut touched = self.component_touched.borrow_mut();
        for (target_key, value) in writes {
            trace!(target = %target_key, "slot updated");
            touched.insert(target_key.component.clone(), now);
            slots.insert(target_key, value);
        }
    }

    /// Apply a transform, falling back to the untransformed raw value on
    /// any compile or runtime failure.
    async fn apply_transform(
        &self,
        target: &BindingTarget,
        key: &ExpressionKey,
        source: &Arc<str>,
        raw: &Value,
    ) -> Value {
        let Some(definition) = self.transforms.compiled(&self.sandbox, source) else {
            return raw.clone();
        };
        let host = TransformHost {
            runtime: self,
            target,
            key_id: key.id(),
            raw: raw.clone(),
        };
        let interpreter = Interpreter::new(&host, IdentMode::Locals);
        let result = match definition.as_ref() {
            TransformDef::Arrow { parameter, body } => {
                interpreter.bind_local(parameter.clone(), raw.clone());
                interpreter.eval_expression(body).await
            }
            TransformDef::Block(script) => {
                interpreter.bind_local("value", raw.clone());
                interpreter.run(script).await
            }
        };
        match result {
            Ok(value) => value,
            Err(error) => {
                self.errors.push(
                    format!("transform:{}:{}", target.component, target.property),
                    error,
                );
                raw.clone()
            }
        }
    }

    /// Read-through field access with expression-value caching, shared by
    /// scripts (`get`) and field-mode evaluation of event expressions.
    pub(crate) async fn read_field_cached(&self, path: &FieldPath) -> Result<Value, ScriptError> {
        let key = ExpressionKey::new(ExpressionMode::Field, &path.to_string());
        if let Some(value) = self.field_cache.borrow().get(&key) {
            return Ok(value.clone());
        }
        let entity = self.bound_entity().ok_or(ScriptError::UnboundEntity)?;
        let value = self.store.read(&entity, path).await?;
        self.field_cache.borrow_mut().insert(key, value.clone());
        Ok(value)
    }

    /// `getCached`: a previously evaluated expression's raw value, without
    /// a new remote read. Unknown expressions yield null; known ones are
    /// evaluated on demand under the caller's recursion guard.
    async fn cached_expression_value(
        &self,
        expression: &str,
        guard: &RefCell<HashSet<ExpressionKey>>,
    ) -> Result<Value, ScriptError> {
        let field_key = ExpressionKey::new(ExpressionMode::Field, expression);
        if let Some(value) = self.field_cache.borrow().get(&field_key) {
            return Ok(value.clone());
        }

        for key in [
            field_key,
            ExpressionKey::new(ExpressionMode::Script, expression),
        ] {
            if self.graph.borrow().metadata.contains_key(&key) {
                return self
                    .evaluate_one(&key, guard)
                    .await
                    .map_err(|error| ScriptError::Dependency {
                        key: key.to_string(),
                        message: error.to_string(),
                    });
            }
        }

        trace!(expression, "getCached miss on unknown expression");
        Ok(Value::Null)
    }

    pub fn bound_entity(&self) -> Option<EntityId> {
        self.context.borrow().entity_id.clone()
    }

    pub fn faceplate_id(&self) -> Option<Arc<str>> {
        self.context.borrow().faceplate_id.clone()
    }

    pub(crate) fn notification_channels(&self) -> Vec<NotificationChannel> {
        self.channels.borrow().clone()
    }

    pub fn set_notification_channels(&self, channels: Vec<NotificationChannel>) {
        *self.channels.borrow_mut() = channels;
    }

    /// Current value of one binding value slot.
    pub fn binding_value(&self, component: &str, property: &str) -> Value {
        let key = TargetKey::new(Arc::from(component), Arc::from(property));
        self.slots.borrow().get(&key).cloned().unwrap_or(Value::Null)
    }

    /// Point-in-time copy of the whole slot map, for the renderer.
    pub fn binding_values(&self) -> IndexMap<TargetKey, Value> {
        self.slots.borrow().clone()
    }

    pub(crate) fn bindings_snapshot_value(&self) -> Value {
        Value::Object(
            self.slots
                .borrow()
                .iter()
                .map(|(key, value)| (Arc::from(key.to_string().as_str()), value.clone()))
                .collect(),
        )
    }

    pub fn component_last_updated(&self, component: &str) -> Option<SystemTime> {
        self.component_touched.borrow().get(component).copied()
    }

    pub fn runtime_errors(&self) -> Vec<RuntimeErrorEntry> {
        self.errors.snapshot()
    }

    pub fn compile_errors(&self) -> Vec<crate::error::CompileError> {
        self.sandbox.compile_errors()
    }

    /// Number of distinct expression keys in the current graph.
    pub fn expression_count(&self) -> usize {
        self.graph.borrow().metadata.len()
    }

    pub(crate) fn graph(&self) -> &RefCell<BindingGraph> {
        &self.graph
    }

    pub(crate) fn field_cache(&self) -> &RefCell<HashMap<ExpressionKey, Value>> {
        &self.field_cache
    }
}

/// Host for script-mode binding expressions: the full sandbox surface.
struct BindingScriptHost<'r> {
    runtime: &'r BindingRuntime,
    key_id: Arc<str>,
    guard: &'r RefCell<HashSet<ExpressionKey>>,
}

impl ScriptHost for BindingScriptHost<'_> {
    fn get<'a>(&'a self, path: &'a FieldPath) -> LocalBoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move { self.runtime.read_field_cached(path).await })
    }

    fn get_cached<'a>(
        &'a self,
        expression: &'a str,
    ) -> LocalBoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move {
            self.runtime
                .cached_expression_value(expression, self.guard)
                .await
        })
    }

    fn binding_value(&self, component: &str, property: &str) -> Value {
        self.runtime.binding_value(component, property)
    }

    fn bindings_snapshot(&self) -> Value {
        self.runtime.bindings_snapshot_value()
    }

    fn get_state(&self, name: &str) -> Value {
        self.runtime.sandbox.state_get(&self.key_id, name)
    }

    fn set_state(&self, name: &str, value: Value) -> Result<(), ScriptError> {
        self.runtime.sandbox.state_set(&self.key_id, name, value);
        Ok(())
    }

    fn module(&self, name: &str) -> Option<Rc<ModuleExports>> {
        self.runtime.sandbox.module(name)
    }

    fn modules_snapshot(&self) -> Value {
        self.runtime.sandbox.modules_snapshot()
    }

    fn ambient(&self, name: &str) -> Option<Value> {
        match name {
            "entityId" => self.runtime.bound_entity().map(|id| Value::Text(id)),
            "faceplateId" => self.runtime.faceplate_id().map(Value::Text),
            "expressionKey" => Some(Value::Text(self.key_id.clone())),
            _ => None,
        }
    }
}

/// Host for field-mode expressions: identifiers resolve as store fields.
struct FieldExpressionHost<'r> {
    runtime: &'r BindingRuntime,
}

impl ScriptHost for FieldExpressionHost<'_> {
    fn get<'a>(&'a self, path: &'a FieldPath) -> LocalBoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move { self.runtime.read_field_cached(path).await })
    }

    fn module(&self, name: &str) -> Option<Rc<ModuleExports>> {
        self.runtime.sandbox.module(name)
    }

    fn modules_snapshot(&self) -> Value {
        self.runtime.sandbox.modules_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn recursion_guard_rejects_reentry() {
        let runtime = BindingRuntime::new(Rc::new(MemoryStore::new()));
        let key = ExpressionKey::new(ExpressionMode::Script, "getCached('x')");
        let guard = RefCell::new(HashSet::from([key.clone()]));

        let error = runtime.evaluate_one(&key, &guard).await.unwrap_err();
        assert!(matches!(error, EngineError::Cycle(_)));
    }
}

/// Host for transform bodies: context values and module accessors, no
/// remote reads and no persistent state.
struct TransformHost<'r> {
    runtime: &'r BindingRuntime,
    target: &'r BindingTarget,
    key_id: Arc<str>,
    raw: Value,
}

impl ScriptHost for TransformHost<'_> {
    fn module(&self, name: &str) -> Option<Rc<ModuleExports>> {
        self.runtime.sandbox.module(name)
    }

    fn modules_snapshot(&self) -> Value {
        self.runtime.sandbox.modules_snapshot()
    }

    fn binding_value(&self, component: &str, property: &str) -> Value {
        self.runtime.binding_value(component, property)
    }

    fn ambient(&self, name: &str) -> Option<Value> {
        match name {
            "value" => Some(self.raw.clone()),
            "component" => Some(Value::Text(self.target.component.clone())),
            "property" => Some(Value::Text(self.target.property.clone())),
            "expressionKey" => Some(Value::Text(self.key_id.clone())),
            "entityId" => self.runtime.bound_entity().map(Value::Text),
            "faceplateId" => self.runtime.faceplate_id().map(Value::Text),
            _ => None,
        }
    }
}
