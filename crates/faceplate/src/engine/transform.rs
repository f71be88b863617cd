//! Transform pipeline.
//!
//! A binding target's optional transform post-processes the raw evaluated
//! value before display. Compiled transforms are cached by their exact
//! source text: identical transform text is reused verbatim across targets
//! and survives graph rebuilds. Compile or runtime failure falls back to
//! the untransformed raw value; a transform never blanks a binding.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::script::ScriptSandbox;
use crate::script::ast::TransformDef;
use crate::script::parser::parse_transform;

/// Source-text keyed cache of compiled transforms. `None` marks a transform
/// that already failed to compile, so the failure is recorded once.
#[derive(Default)]
pub struct TransformCache {
    compiled: RefCell<HashMap<Arc<str>, Option<Rc<TransformDef>>>>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiled(
        &self,
        sandbox: &ScriptSandbox,
        source: &Arc<str>,
    ) -> Option<Rc<TransformDef>> {
        if let Some(entry) = self.compiled.borrow().get(source) {
            return entry.clone();
        }
        let entry = match parse_transform(source, "transform") {
            Ok(definition) => Some(Rc::new(definition)),
            Err(error) => {
                sandbox.record_compile_error(format!("transform:{source}"), error.to_string());
                None
            }
        };
        self.compiled
            .borrow_mut()
            .insert(source.clone(), entry.clone());
        entry
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.compiled.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_failures_are_cached_and_recorded_once() {
        let cache = TransformCache::new();
        let sandbox = ScriptSandbox::new();
        let source: Arc<str> = Arc::from("value =>");

        assert!(cache.compiled(&sandbox, &source).is_none());
        assert!(cache.compiled(&sandbox, &source).is_none());
        assert_eq!(sandbox.compile_errors().len(), 1);
    }

    #[test]
    fn identical_text_shares_one_compilation() {
        let cache = TransformCache::new();
        let sandbox = ScriptSandbox::new();
        let source: Arc<str> = Arc::from("value => value * 2");

        let first = cache.compiled(&sandbox, &source).unwrap();
        let second = cache.compiled(&sandbox, &source).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }
}
