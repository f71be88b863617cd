//! Binding graph builder.
//!
//! Compiles a flat list of binding definitions into a compact graph: one
//! metadata entry per *unique* expression (deduplicated across components),
//! a reverse index from dependency name to dependent expression keys, and a
//! fan-out list of binding targets per key. Evaluation work and remote
//! subscriptions are proportional to the number of distinct expressions,
//! not the number of bindings.

use std::fmt;
use std::sync::Arc;

use chumsky::prelude::Parser;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::script::lexer::{Token, lexer};
use crate::store::INDIRECTION_DELIMITER;
use crate::value::parse_literal;

/// Evaluation strategy of one expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpressionMode {
    Literal,
    Field,
    Script,
}

impl ExpressionMode {
    /// Mode inference for definitions without an explicit mode: a
    /// literal-parseable expression is literal, everything else is a field.
    pub fn infer(expression: &str) -> Self {
        if parse_literal(expression).is_some() {
            ExpressionMode::Literal
        } else {
            ExpressionMode::Field
        }
    }
}

impl fmt::Display for ExpressionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ExpressionMode::Literal => "literal",
            ExpressionMode::Field => "field",
            ExpressionMode::Script => "script",
        })
    }
}

/// One binding definition, as loaded from the persistence service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingDefinition {
    pub component: String,
    pub property: String,
    pub expression: String,
    #[serde(default)]
    pub mode: Option<ExpressionMode>,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Derived identity of an expression: mode plus whitespace-collapsed text.
/// Two definitions with the same key share one graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpressionKey {
    pub mode: ExpressionMode,
    pub text: Arc<str>,
}

impl ExpressionKey {
    pub fn new(mode: ExpressionMode, raw: &str) -> Self {
        let normalized: Vec<&str> = raw.split_whitespace().collect();
        Self {
            mode,
            text: Arc::from(normalized.join(" ")),
        }
    }

    /// Stable string identity, used for sandbox cache and state bucket keys.
    pub fn id(&self) -> Arc<str> {
        Arc::from(self.to_string())
    }
}

impl fmt::Display for ExpressionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}::{}", self.mode, self.text)
    }
}

/// Everything known about one distinct expression.
#[derive(Debug, Clone)]
pub struct ExpressionMeta {
    pub text: Arc<str>,
    pub mode: ExpressionMode,
    pub dependencies: IndexSet<Arc<str>>,
    pub description: Option<String>,
}

/// A (component, property, transform) display target of one expression.
#[derive(Debug, Clone)]
pub struct BindingTarget {
    pub component: Arc<str>,
    pub property: Arc<str>,
    pub transform: Option<Arc<str>>,
}

/// Binding value slot key: `component:property`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub component: Arc<str>,
    pub property: Arc<str>,
}

impl TargetKey {
    pub fn new(component: Arc<str>, property: Arc<str>) -> Self {
        Self {
            component,
            property,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.component, self.property)
    }
}

/// The compiled binding graph.
#[derive(Debug, Default)]
pub struct BindingGraph {
    pub metadata: IndexMap<ExpressionKey, ExpressionMeta>,
    /// Dependency name -> expression keys that reference it. Limits
    /// notification fan-out to exactly the dependents.
    pub dependency_index: IndexMap<Arc<str>, IndexSet<ExpressionKey>>,
    pub targets: IndexMap<ExpressionKey, Vec<BindingTarget>>,
}

impl BindingGraph {
    /// Compile binding definitions into a graph. Synchronous and pure: no
    /// store interaction, no failure modes beyond skipping incomplete
    /// definitions.
    pub fn build(definitions: &[BindingDefinition]) -> Self {
        let mut graph = BindingGraph::default();

        for definition in definitions {
            if definition.component.trim().is_empty()
                || definition.property.trim().is_empty()
                || definition.expression.trim().is_empty()
            {
                debug!(?definition, "skipping incomplete binding definition");
                continue;
            }

            let mode = definition
                .mode
                .unwrap_or_else(|| ExpressionMode::infer(&definition.expression));
            let expression = match mode {
                ExpressionMode::Script => definition
                    .expression
                    .trim()
                    .strip_prefix("script:")
                    .unwrap_or(definition.expression.trim()),
                _ => definition.expression.trim(),
            };
            let key = ExpressionKey::new(mode, expression);

            let mut dependencies: IndexSet<Arc<str>> = definition
                .dependencies
                .iter()
                .map(|name| Arc::from(name.trim()))
                .collect();
            if mode == ExpressionMode::Field {
                dependencies.extend(extract_field_dependencies(&key.text));
            }

            match graph.metadata.get_mut(&key) {
                Some(meta) => {
                    // Same key from a differently-worded definition: keep
                    // the union of declared dependencies.
                    meta.dependencies.extend(dependencies.iter().cloned());
                    if meta.description.is_none() {
                        meta.description = definition.description.clone();
                    }
                }
                None => {
                    graph.metadata.insert(
                        key.clone(),
                        ExpressionMeta {
                            text: key.text.clone(),
                            mode,
                            dependencies: dependencies.clone(),
                            description: definition.description.clone(),
                        },
                    );
                }
            }

            for dependency in &graph.metadata[&key].dependencies {
                graph
                    .dependency_index
                    .entry(dependency.clone())
                    .or_default()
                    .insert(key.clone());
            }

            graph
                .targets
                .entry(key)
                .or_default()
                .push(BindingTarget {
                    component: Arc::from(definition.component.as_str()),
                    property: Arc::from(definition.property.as_str()),
                    transform: definition
                        .transform
                        .as_deref()
                        .map(str::trim)
                        .filter(|transform| !transform.is_empty())
                        .map(Arc::from),
                });
        }

        debug!(
            expressions = graph.metadata.len(),
            dependencies = graph.dependency_index.len(),
            "binding graph built"
        );
        graph
    }

    pub fn dependents(&self, dependency: &str) -> Vec<ExpressionKey> {
        self.dependency_index
            .get(dependency)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Union of every expression's dependencies, in first-seen order.
    pub fn distinct_dependencies(&self) -> IndexSet<Arc<str>> {
        self.dependency_index.keys().cloned().collect()
    }
}

fn lex_expression(expression: &str) -> Option<Vec<Token<'_>>> {
    let (tokens, errors) = lexer().parse(expression).into_output_errors();
    if !errors.is_empty() {
        return None;
    }
    Some(
        tokens?
            .into_iter()
            .map(|token| token.node)
            .filter(|token| !matches!(token, Token::Comment(_)))
            .collect(),
    )
}

/// True when the expression is a single bare identifier, optionally with
/// indirection hops (`Pump->Motor->Speed`).
pub fn is_bare_path(expression: &str) -> bool {
    let Some(tokens) = lex_expression(expression) else {
        return false;
    };
    if tokens.is_empty() {
        return false;
    }
    tokens.iter().enumerate().all(|(index, token)| {
        if index % 2 == 0 {
            matches!(token, Token::Identifier(_))
        } else {
            matches!(token, Token::Arrow)
        }
    }) && tokens.len() % 2 == 1
}

/// Dependency extraction for field-mode expressions, over the real token
/// stream: a bare path is itself the one dependency; in an arithmetic
/// expression every identifier path contributes one, while call names,
/// member accesses and string-literal contents never do.
pub fn extract_field_dependencies(expression: &str) -> IndexSet<Arc<str>> {
    let mut dependencies = IndexSet::new();
    let Some(tokens) = lex_expression(expression) else {
        // Unlexable text: treat the whole expression as one dependency so a
        // later registration failure surfaces in the error log.
        dependencies.insert(Arc::from(expression.trim()));
        return dependencies;
    };

    let mut index = 0;
    while index < tokens.len() {
        let Token::Identifier(root) = tokens[index] else {
            index += 1;
            continue;
        };
        let after_dot = index > 0 && matches!(tokens[index - 1], Token::Dot);

        let mut segments = vec![root];
        let mut next = index + 1;
        while matches!(tokens.get(next), Some(Token::Arrow)) {
            match tokens.get(next + 1) {
                Some(Token::Identifier(segment)) => {
                    segments.push(segment);
                    next += 2;
                }
                _ => break,
            }
        }

        let is_call =
            segments.len() == 1 && matches!(tokens.get(next), Some(Token::BracketRoundOpen));
        if !after_dot && !is_call {
            dependencies.insert(Arc::from(segments.join(INDIRECTION_DELIMITER)));
        }
        index = next;
    }
    dependencies
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn mode_inference() {
        assert_eq!(ExpressionMode::infer("42"), ExpressionMode::Literal);
        assert_eq!(ExpressionMode::infer("'label'"), ExpressionMode::Literal);
        assert_eq!(ExpressionMode::infer("Temperature"), ExpressionMode::Field);
    }

    #[test]
    fn keys_normalize_whitespace() {
        let a = ExpressionKey::new(ExpressionMode::Field, "Level  *  100");
        let b = ExpressionKey::new(ExpressionMode::Field, "Level * 100");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "field::Level * 100");
    }

    #[test]
    fn duplicate_expressions_share_one_node() {
        let graph = BindingGraph::build(&[
            definition("Gauge1", "value", "X"),
            definition("Gauge2", "value", "X"),
        ]);
        assert_eq!(graph.metadata.len(), 1);
        let key = ExpressionKey::new(ExpressionMode::Field, "X");
        assert_eq!(graph.targets[&key].len(), 2);
        assert_eq!(graph.dependents("X"), vec![key]);
    }

    #[test]
    fn incomplete_definitions_are_skipped() {
        let graph = BindingGraph::build(&[
            definition("", "value", "X"),
            definition("Gauge", "", "X"),
            definition("Gauge", "value", "  "),
        ]);
        assert!(graph.metadata.is_empty());
    }

    #[test]
    fn script_prefix_is_stripped() {
        let mut with_prefix = definition("Gauge", "value", "script: getState('x')");
        with_prefix.mode = Some(ExpressionMode::Script);
        let graph = BindingGraph::build(&[with_prefix]);
        let (key, _) = graph.metadata.first().unwrap();
        assert_eq!(key.text.as_ref(), "getState('x')");
    }

    #[test]
    fn declared_dependency_union_on_key_collision() {
        let mut first = definition("A", "value", "script:compute()");
        first.mode = Some(ExpressionMode::Script);
        first.dependencies = vec!["Temperature".to_string()];
        let mut second = definition("B", "value", "script:  compute()");
        second.mode = Some(ExpressionMode::Script);
        second.dependencies = vec!["Pressure".to_string()];

        let graph = BindingGraph::build(&[first, second]);
        assert_eq!(graph.metadata.len(), 1);
        let meta = graph.metadata.values().next().unwrap();
        let names: Vec<&str> = meta.dependencies.iter().map(|d| d.as_ref()).collect();
        assert_eq!(names, vec!["Temperature", "Pressure"]);
        assert_eq!(graph.dependents("Pressure").len(), 1);
    }

    #[test]
    fn bare_path_detection() {
        assert!(is_bare_path("Temperature"));
        assert!(is_bare_path("Pump->Motor->Speed"));
        assert!(!is_bare_path("Level * 100"));
        assert!(!is_bare_path("clamp(Level, 0, 100)"));
    }

    #[test]
    fn arithmetic_dependency_extraction() {
        let dependencies = extract_field_dependencies("FlowIn - FlowOut * 0.5");
        let names: Vec<&str> = dependencies.iter().map(|d| d.as_ref()).collect();
        assert_eq!(names, vec!["FlowIn", "FlowOut"]);
    }

    #[test]
    fn call_names_and_string_contents_are_not_dependencies() {
        let dependencies = extract_field_dependencies("clamp(Level, 0, 100) + 'Level'");
        let names: Vec<&str> = dependencies.iter().map(|d| d.as_ref()).collect();
        assert_eq!(names, vec!["Level"]);
    }

    #[test]
    fn indirection_paths_stay_one_dependency() {
        let dependencies = extract_field_dependencies("Pump->Speed / MaxSpeed");
        let names: Vec<&str> = dependencies.iter().map(|d| d.as_ref()).collect();
        assert_eq!(names, vec!["Pump->Speed", "MaxSpeed"]);
    }
}
