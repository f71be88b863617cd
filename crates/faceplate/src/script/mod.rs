//! Script sandbox: user-authored scripts compiled into callable units.
//!
//! The sandbox is an embedded interpreter over an allow-listed expression
//! and statement language; user text is never handed to any host
//! compilation facility. Modules compile once into shared read-only export
//! tables; per-expression scripts compile lazily and are cached by their
//! expression key; each expression owns a private state bucket that
//! survives evaluation passes and is cleared only on full graph teardown.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use chumsky::prelude::{Rich, SimpleSpan};
use futures_util::FutureExt;
use indexmap::IndexMap;
use tracing::debug;

use crate::error::{CompileError, ScriptError};
use crate::persistence::ScriptModuleDef;
use crate::value::Value;

pub mod ast;
pub mod helpers;
pub mod interpreter;
pub mod lexer;
pub mod parser;

use ast::{FunctionDef, ModuleItem, Script};
use interpreter::{IdentMode, Interpreter, ScriptHost};

pub type Span = SimpleSpan;
pub type ParseError<'src, T> = Rich<'src, T, Span>;

#[derive(Debug, Clone)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

/// One export of a compiled module.
#[derive(Clone)]
pub enum Export {
    Const(Value),
    Function(Rc<FunctionDef>),
}

/// Read-only export table of one compiled module.
pub struct ModuleExports {
    pub name: Arc<str>,
    exports: IndexMap<Arc<str>, Export>,
}

impl ModuleExports {
    pub fn new(name: Arc<str>, exports: IndexMap<Arc<str>, Export>) -> Self {
        Self { name, exports }
    }

    pub fn empty(name: Arc<str>) -> Self {
        Self {
            name,
            exports: IndexMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// The module's constant exports as an object value (functions are not
    /// first-class values and are elided).
    pub fn constants_object(&self) -> Value {
        Value::Object(
            self.exports
                .iter()
                .filter_map(|(name, export)| match export {
                    Export::Const(value) => Some((name.clone(), value.clone())),
                    Export::Function(_) => None,
                })
                .collect(),
        )
    }
}

/// Host for module constant evaluation: earlier constants of the same
/// module resolve by name, nothing else is reachable.
struct ModuleConstHost<'a> {
    exports: &'a IndexMap<Arc<str>, Export>,
}

impl ScriptHost for ModuleConstHost<'_> {
    fn ambient(&self, name: &str) -> Option<Value> {
        match self.exports.get(name) {
            Some(Export::Const(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

/// The sandbox: compiled modules, per-expression script cache and state
/// buckets.
#[derive(Default)]
pub struct ScriptSandbox {
    modules: RefCell<IndexMap<Arc<str>, Rc<ModuleExports>>>,
    compile_errors: RefCell<Vec<CompileError>>,
    scripts: RefCell<HashMap<Arc<str>, Result<Rc<Script>, ScriptError>>>,
    state: RefCell<HashMap<Arc<str>, HashMap<Arc<str>, Value>>>,
}

impl ScriptSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every module source once. A failing module records its error
    /// and still registers an empty export table so later scripts can
    /// reference it without a hard failure; remaining modules compile
    /// regardless.
    pub fn compile_modules(&self, definitions: &[ScriptModuleDef]) {
        self.modules.borrow_mut().clear();
        self.compile_errors.borrow_mut().clear();

        for definition in definitions {
            let name: Arc<str> = Arc::from(definition.name.as_str());
            let exports = match parser::parse_module(&definition.source, &definition.name) {
                Ok(items) => self.compile_module_items(&name, items),
                Err(error) => {
                    self.record_compile_error(name.clone(), error.to_string());
                    ModuleExports::empty(name.clone())
                }
            };
            debug!(module = %name, empty = exports.is_empty(), "module compiled");
            self.modules.borrow_mut().insert(name, Rc::new(exports));
        }
    }

    fn compile_module_items(&self, name: &Arc<str>, items: Vec<ModuleItem>) -> ModuleExports {
        let mut exports: IndexMap<Arc<str>, Export> = IndexMap::new();
        for item in items {
            match item {
                ModuleItem::Function(def) => {
                    exports.insert(def.name.clone(), Export::Function(Rc::new(def)));
                }
                ModuleItem::Const {
                    name: const_name,
                    value,
                } => {
                    let host = ModuleConstHost { exports: &exports };
                    let interpreter = Interpreter::new(&host, IdentMode::Locals);
                    // Constant hosts have no suspension points, so the
                    // future completes immediately.
                    match interpreter.eval_expression(&value).now_or_never() {
                        Some(Ok(evaluated)) => {
                            exports.insert(const_name, Export::Const(evaluated));
                        }
                        Some(Err(error)) => {
                            self.record_compile_error(
                                format!("{name}::{const_name}"),
                                error.to_string(),
                            );
                        }
                        None => {
                            self.record_compile_error(
                                format!("{name}::{const_name}"),
                                "constant expression suspended on a remote call",
                            );
                        }
                    }
                }
            }
        }
        ModuleExports::new(name.clone(), exports)
    }

    /// Lazily compile (and cache) the script for one expression key.
    /// Failures are cached too: repeated evaluation passes never recompile.
    pub fn compiled_script(
        &self,
        key: &Arc<str>,
        source: &str,
    ) -> Result<Rc<Script>, ScriptError> {
        if let Some(cached) = self.scripts.borrow().get(key) {
            return cached.clone();
        }
        let compiled = parser::parse_script(source, key).map(Rc::new);
        if let Err(error) = &compiled {
            self.record_compile_error(key.clone(), error.to_string());
        }
        self.scripts
            .borrow_mut()
            .insert(key.clone(), compiled.clone());
        compiled
    }

    pub fn module(&self, name: &str) -> Option<Rc<ModuleExports>> {
        self.modules.borrow().get(name).cloned()
    }

    pub fn modules_snapshot(&self) -> Value {
        Value::Object(
            self.modules
                .borrow()
                .iter()
                .map(|(name, module)| (name.clone(), module.constants_object()))
                .collect(),
        )
    }

    pub fn record_compile_error(&self, context: impl Into<Arc<str>>, message: impl Into<String>) {
        let error = CompileError::new(context, message);
        tracing::warn!(context = %error.context, message = %error.message, "compile error");
        self.compile_errors.borrow_mut().push(error);
    }

    pub fn compile_errors(&self) -> Vec<CompileError> {
        self.compile_errors.borrow().clone()
    }

    pub fn state_get(&self, key: &Arc<str>, name: &str) -> Value {
        self.state
            .borrow()
            .get(key)
            .and_then(|bucket| bucket.get(name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn state_set(&self, key: &Arc<str>, name: impl Into<Arc<str>>, value: Value) {
        self.state
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .insert(name.into(), value);
    }

    /// Full graph teardown: drop compiled per-expression scripts and every
    /// state bucket. Modules survive until the next `compile_modules`.
    pub fn clear(&self) {
        self.scripts.borrow_mut().clear();
        self.state.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, source: &str) -> ScriptModuleDef {
        ScriptModuleDef {
            name: name.to_string(),
            source: source.to_string(),
        }
    }

    #[test]
    fn modules_compile_into_export_tables() {
        let sandbox = ScriptSandbox::new();
        sandbox.compile_modules(&[module(
            "Limits",
            "let max_level = 100; fn headroom(level) { max_level - level }",
        )]);

        let exports = sandbox.module("Limits").unwrap();
        assert!(matches!(
            exports.get("max_level"),
            Some(Export::Const(Value::Number(n))) if *n == 100.0
        ));
        assert!(matches!(exports.get("headroom"), Some(Export::Function(_))));
    }

    #[test]
    fn failing_module_still_registers_empty_entry() {
        let sandbox = ScriptSandbox::new();
        sandbox.compile_modules(&[
            module("Broken", "let = nonsense ;;;"),
            module("Fine", "let answer = 42;"),
        ]);

        assert!(sandbox.module("Broken").unwrap().is_empty());
        assert!(!sandbox.module("Fine").unwrap().is_empty());
        assert_eq!(sandbox.compile_errors().len(), 1);
        assert_eq!(sandbox.compile_errors()[0].context.as_ref(), "Broken");
    }

    #[test]
    fn script_cache_remembers_failures() {
        let sandbox = ScriptSandbox::new();
        let key: Arc<str> = Arc::from("script::broken(");
        assert!(sandbox.compiled_script(&key, "broken(").is_err());
        assert!(sandbox.compiled_script(&key, "broken(").is_err());
        // One recorded failure: the second lookup came from the cache.
        assert_eq!(sandbox.compile_errors().len(), 1);
    }

    #[test]
    fn state_buckets_are_isolated_per_key() {
        let sandbox = ScriptSandbox::new();
        let first: Arc<str> = Arc::from("script::a");
        let second: Arc<str> = Arc::from("script::b");
        sandbox.state_set(&first, "count", Value::Number(1.0));
        assert_eq!(sandbox.state_get(&first, "count"), Value::Number(1.0));
        assert_eq!(sandbox.state_get(&second, "count"), Value::Null);
    }
}
