//! Tree-walking interpreter for the sandboxed script language.
//!
//! Scripts never touch host facilities directly; everything flows through
//! the [`ScriptHost`] trait: remote reads, cached expression values, sibling
//! binding values, private state and module exports. The interpreter itself
//! is async because `get(path)` suspends on remote reads; all other
//! operations complete synchronously.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use futures_util::future::LocalBoxFuture;

use super::ast::{BinaryOp, Expr, FunctionDef, Script, Stmt, UnaryOp};
use super::{Export, ModuleExports, Spanned, helpers};
use crate::error::ScriptError;
use crate::store::FieldPath;
use crate::value::Value;

/// Nested module/function calls beyond this depth abort the evaluation.
pub const MAX_CALL_DEPTH: usize = 32;

/// How bare identifiers resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentMode {
    /// Script bodies: locals, then ambient context values.
    Locals,
    /// Field-mode binding expressions: identifiers are store fields.
    Fields,
}

/// Host facilities exposed to a running script.
///
/// Defaults deny everything; each evaluation site implements exactly the
/// surface it grants (binding scripts get the full set, transforms get no
/// remote reads, module constants get nothing but sibling constants).
pub trait ScriptHost {
    fn get<'a>(
        &'a self,
        _path: &'a FieldPath,
    ) -> LocalBoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async {
            Err(ScriptError::Type(
                "remote reads are not available in this context".into(),
            ))
        })
    }

    fn get_cached<'a>(
        &'a self,
        _expression: &'a str,
    ) -> LocalBoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async {
            Err(ScriptError::Type(
                "cached expression values are not available in this context".into(),
            ))
        })
    }

    fn binding_value(&self, _component: &str, _property: &str) -> Value {
        Value::Null
    }

    fn bindings_snapshot(&self) -> Value {
        Value::Null
    }

    fn get_state(&self, _name: &str) -> Value {
        Value::Null
    }

    fn set_state(&self, _name: &str, _value: Value) -> Result<(), ScriptError> {
        Err(ScriptError::Type(
            "persistent state is not available in this context".into(),
        ))
    }

    fn module(&self, _name: &str) -> Option<Rc<ModuleExports>> {
        None
    }

    fn modules_snapshot(&self) -> Value {
        Value::Null
    }

    /// Ambient context values (`value`, `trigger`, `entityId`, ...).
    fn ambient(&self, _name: &str) -> Option<Value> {
        None
    }
}

enum Flow {
    Normal,
    Return(Value),
}

/// One script evaluation. Construct fresh per call; locals do not leak
/// between evaluations (persistent data goes through `setState`).
pub struct Interpreter<'h> {
    host: &'h dyn ScriptHost,
    mode: IdentMode,
    scopes: RefCell<Vec<HashMap<Arc<str>, Value>>>,
    depth: Cell<usize>,
    current_module: RefCell<Option<Rc<ModuleExports>>>,
}

impl<'h> Interpreter<'h> {
    pub fn new(host: &'h dyn ScriptHost, mode: IdentMode) -> Self {
        Self {
            host,
            mode,
            scopes: RefCell::new(vec![HashMap::new()]),
            depth: Cell::new(0),
            current_module: RefCell::new(None),
        }
    }

    /// Pre-bind a local in the root scope (transform `value`, handler
    /// parameters).
    pub fn bind_local(&self, name: impl Into<Arc<str>>, value: Value) {
        self.scopes.borrow_mut()[0].insert(name.into(), value);
    }

    /// Run a script body: statements, then the optional tail expression.
    pub async fn run(&self, script: &Script) -> Result<Value, ScriptError> {
        for statement in &script.statements {
            if let Flow::Return(value) = self.eval_stmt(statement).await? {
                return Ok(value);
            }
        }
        match &script.tail {
            Some(tail) => self.eval_expr(tail).await,
            None => Ok(Value::Null),
        }
    }

    /// Evaluate a single expression (field-mode bindings, arrow transforms).
    pub async fn eval_expression(&self, expression: &Spanned<Expr>) -> Result<Value, ScriptError> {
        self.eval_expr(expression).await
    }

    fn lookup_local(&self, name: &str) -> Option<Value> {
        let scopes = self.scopes.borrow();
        scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
    }

    fn assign_local(&self, name: &Arc<str>, value: Value) -> Result<(), ScriptError> {
        let mut scopes = self.scopes.borrow_mut();
        for scope in scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        Err(ScriptError::UnknownIdentifier(name.clone()))
    }

    fn eval_stmt<'a>(
        &'a self,
        statement: &'a Spanned<Stmt>,
    ) -> LocalBoxFuture<'a, Result<Flow, ScriptError>> {
        Box::pin(async move {
            match &statement.node {
                Stmt::Let { name, value } => {
                    let value = self.eval_expr(value).await?;
                    self.scopes
                        .borrow_mut()
                        .last_mut()
                        .expect("scope stack is never empty")
                        .insert(name.clone(), value);
                    Ok(Flow::Normal)
                }
                Stmt::Assign { name, value } => {
                    let value = self.eval_expr(value).await?;
                    self.assign_local(name, value)?;
                    Ok(Flow::Normal)
                }
                Stmt::If {
                    condition,
                    then_block,
                    else_block,
                } => {
                    let branch = if self.eval_expr(condition).await?.truthy() {
                        then_block
                    } else {
                        else_block
                    };
                    self.scopes.borrow_mut().push(HashMap::new());
                    let mut flow = Flow::Normal;
                    for statement in branch {
                        match self.eval_stmt(statement).await {
                            Ok(Flow::Normal) => {}
                            Ok(returned) => {
                                flow = returned;
                                break;
                            }
                            Err(error) => {
                                self.scopes.borrow_mut().pop();
                                return Err(error);
                            }
                        }
                    }
                    self.scopes.borrow_mut().pop();
                    Ok(flow)
                }
                Stmt::Return(expression) => {
                    let value = match expression {
                        Some(expression) => self.eval_expr(expression).await?,
                        None => Value::Null,
                    };
                    Ok(Flow::Return(value))
                }
                Stmt::Expr(expression) => {
                    self.eval_expr(expression).await?;
                    Ok(Flow::Normal)
                }
            }
        })
    }

    fn eval_expr<'a>(
        &'a self,
        expression: &'a Spanned<Expr>,
    ) -> LocalBoxFuture<'a, Result<Value, ScriptError>> {
        Box::pin(async move {
            match &expression.node {
                Expr::Literal(value) => Ok(value.clone()),
                Expr::Ident(name) => self.eval_ident(name).await,
                Expr::FieldRef(path) => match self.mode {
                    IdentMode::Fields => self.host.get(path).await,
                    IdentMode::Locals => Err(ScriptError::Type(format!(
                        "field reference {path} is not allowed here; use get(\"{path}\")"
                    ))),
                },
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval_expr(item).await?);
                    }
                    Ok(Value::List(values))
                }
                Expr::Unary { op, operand } => {
                    let value = self.eval_expr(operand).await?;
                    self.eval_unary(*op, value)
                }
                Expr::Binary { op, left, right } => self.eval_binary(*op, left, right).await,
                Expr::Call {
                    function,
                    arguments,
                } => self.eval_call(function, arguments).await,
                Expr::Member { object, field } => self.eval_member(object, field).await,
                Expr::MethodCall {
                    object,
                    method,
                    arguments,
                } => self.eval_method_call(object, method, arguments).await,
            }
        })
    }

    async fn eval_ident(&self, name: &Arc<str>) -> Result<Value, ScriptError> {
        if let Some(value) = self.lookup_local(name) {
            return Ok(value);
        }
        if let Some(value) = self.host.ambient(name) {
            return Ok(value);
        }
        // Inside a module function, sibling constants resolve by name.
        if let Some(module) = self.current_module.borrow().clone() {
            if let Some(Export::Const(value)) = module.get(name) {
                return Ok(value.clone());
            }
        }
        match self.mode {
            IdentMode::Fields => self.host.get(&FieldPath::single(name.clone())).await,
            IdentMode::Locals => Err(ScriptError::UnknownIdentifier(name.clone())),
        }
    }

    fn eval_unary(&self, op: UnaryOp, value: Value) -> Result<Value, ScriptError> {
        match op {
            UnaryOp::Negate => value
                .as_number()
                .map(|number| Value::Number(-number))
                .ok_or_else(|| ScriptError::Type(format!("cannot negate {value}"))),
            UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
        }
    }

    async fn eval_binary(
        &self,
        op: BinaryOp,
        left: &Spanned<Expr>,
        right: &Spanned<Expr>,
    ) -> Result<Value, ScriptError> {
        // Short-circuit forms first.
        match op {
            BinaryOp::And => {
                if !self.eval_expr(left).await?.truthy() {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval_expr(right).await?.truthy()));
            }
            BinaryOp::Or => {
                if self.eval_expr(left).await?.truthy() {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval_expr(right).await?.truthy()));
            }
            _ => {}
        }

        let left = self.eval_expr(left).await?;
        let right = self.eval_expr(right).await?;
        match op {
            BinaryOp::Add => match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                (Value::Text(_), _) | (_, Value::Text(_)) => Ok(Value::text(format!(
                    "{}{}",
                    left.to_display_string(),
                    right.to_display_string()
                ))),
                _ => Err(ScriptError::Type(format!("cannot add {left} and {right}"))),
            },
            BinaryOp::Subtract => numeric_op(op, &left, &right, |a, b| a - b),
            BinaryOp::Multiply => numeric_op(op, &left, &right, |a, b| a * b),
            BinaryOp::Divide => numeric_op(op, &left, &right, |a, b| a / b),
            BinaryOp::Modulo => numeric_op(op, &left, &right, |a, b| a % b),
            BinaryOp::Equal => Ok(Value::Bool(left == right)),
            BinaryOp::NotEqual => Ok(Value::Bool(left != right)),
            BinaryOp::Greater => ordering_op(&left, &right, |ordering| ordering > 0.0),
            BinaryOp::GreaterOrEqual => ordering_op(&left, &right, |ordering| ordering >= 0.0),
            BinaryOp::Less => ordering_op(&left, &right, |ordering| ordering < 0.0),
            BinaryOp::LessOrEqual => ordering_op(&left, &right, |ordering| ordering <= 0.0),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    async fn eval_call(
        &self,
        function: &Arc<str>,
        arguments: &[Spanned<Expr>],
    ) -> Result<Value, ScriptError> {
        // `if` is a special form: only the taken branch is evaluated.
        if function.as_ref() == "if" {
            if arguments.len() != 3 {
                return Err(ScriptError::Arity {
                    function: function.clone(),
                    expected: 3,
                    got: arguments.len(),
                });
            }
            let condition = self.eval_expr(&arguments[0]).await?;
            let branch = if condition.truthy() {
                &arguments[1]
            } else {
                &arguments[2]
            };
            return self.eval_expr(branch).await;
        }

        // Sandbox context functions.
        match function.as_ref() {
            "get" => {
                let path = self.text_argument(function, arguments, 0, 1).await?;
                return self.host.get(&FieldPath::parse(&path)).await;
            }
            "getCached" => {
                let expression = self.text_argument(function, arguments, 0, 1).await?;
                return self.host.get_cached(&expression).await;
            }
            "getBindingValue" => {
                let component = self.text_argument(function, arguments, 0, 2).await?;
                let property = self.text_argument(function, arguments, 1, 2).await?;
                return Ok(self.host.binding_value(&component, &property));
            }
            "getState" => {
                let name = self.text_argument(function, arguments, 0, 1).await?;
                return Ok(self.host.get_state(&name));
            }
            "setState" => {
                if arguments.len() != 2 {
                    return Err(ScriptError::Arity {
                        function: function.clone(),
                        expected: 2,
                        got: arguments.len(),
                    });
                }
                let name = self.text_argument(function, arguments, 0, 2).await?;
                let value = self.eval_expr(&arguments[1]).await?;
                self.host.set_state(&name, value)?;
                return Ok(Value::Null);
            }
            "bindingsSnapshot" => return Ok(self.host.bindings_snapshot()),
            "module" => {
                let name = self.text_argument(function, arguments, 0, 1).await?;
                let module = self
                    .host
                    .module(&name)
                    .ok_or_else(|| ScriptError::UnknownModule(Arc::from(name.as_str())))?;
                return Ok(module.constants_object());
            }
            "modules" => return Ok(self.host.modules_snapshot()),
            _ => {}
        }

        let mut values = Vec::with_capacity(arguments.len());
        for argument in arguments {
            values.push(self.eval_expr(argument).await?);
        }

        if let Some(result) = helpers::call(function, &values) {
            return result;
        }

        // Bare calls inside a module body reach that module's own functions.
        let own = self
            .current_module
            .borrow()
            .clone()
            .and_then(|module| match module.get(function) {
                Some(Export::Function(def)) => Some((module.clone(), def.clone())),
                _ => None,
            });
        if let Some((module, def)) = own {
            return self.call_module_function(module, &def, values).await;
        }

        Err(ScriptError::UnknownFunction(function.clone()))
    }

    async fn eval_member(
        &self,
        object: &Spanned<Expr>,
        field: &Arc<str>,
    ) -> Result<Value, ScriptError> {
        if let Some(module) = self.syntactic_module(object).await? {
            return match module.get(field) {
                Some(Export::Const(value)) => Ok(value.clone()),
                Some(Export::Function(_)) => Err(ScriptError::Type(format!(
                    "{}.{} is a function; call it with arguments",
                    module.name, field
                ))),
                None => Ok(Value::Null),
            };
        }
        let value = self.eval_expr(object).await?;
        match value {
            Value::Object(fields) => Ok(fields.get(field.as_ref()).cloned().unwrap_or(Value::Null)),
            other => Err(ScriptError::Type(format!(
                "cannot access field {field} on {other}"
            ))),
        }
    }

    async fn eval_method_call(
        &self,
        object: &Spanned<Expr>,
        method: &Arc<str>,
        arguments: &[Spanned<Expr>],
    ) -> Result<Value, ScriptError> {
        let module = self
            .syntactic_module(object)
            .await?
            .ok_or_else(|| ScriptError::Type(format!("{method} is not callable here")))?;
        let def = match module.get(method) {
            Some(Export::Function(def)) => def.clone(),
            Some(Export::Const(_)) => {
                return Err(ScriptError::Type(format!(
                    "{}.{} is a constant, not a function",
                    module.name, method
                )));
            }
            None => return Err(ScriptError::UnknownFunction(method.clone())),
        };
        let mut values = Vec::with_capacity(arguments.len());
        for argument in arguments {
            values.push(self.eval_expr(argument).await?);
        }
        self.call_module_function(module, &def, values).await
    }

    /// Resolve an expression that syntactically names a module: a bare
    /// identifier (unless shadowed by a local) or a `module("name")` call.
    async fn syntactic_module(
        &self,
        object: &Spanned<Expr>,
    ) -> Result<Option<Rc<ModuleExports>>, ScriptError> {
        match &object.node {
            Expr::Ident(name) if self.lookup_local(name).is_none() => Ok(self.host.module(name)),
            Expr::Call {
                function,
                arguments,
            } if function.as_ref() == "module" => {
                let name = self.text_argument(function, arguments, 0, 1).await?;
                Ok(Some(self.host.module(&name).ok_or_else(|| {
                    ScriptError::UnknownModule(Arc::from(name.as_str()))
                })?))
            }
            _ => Ok(None),
        }
    }

    async fn call_module_function(
        &self,
        module: Rc<ModuleExports>,
        def: &FunctionDef,
        arguments: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        if arguments.len() != def.parameters.len() {
            return Err(ScriptError::Arity {
                function: def.name.clone(),
                expected: def.parameters.len(),
                got: arguments.len(),
            });
        }
        if self.depth.get() >= MAX_CALL_DEPTH {
            return Err(ScriptError::CallDepth);
        }
        self.depth.set(self.depth.get() + 1);

        // Functions see only their parameters, not caller locals.
        let mut frame: HashMap<Arc<str>, Value> =
            def.parameters.iter().cloned().zip(arguments).collect();
        let saved_scopes = {
            let mut scopes = self.scopes.borrow_mut();
            std::mem::replace(&mut *scopes, vec![std::mem::take(&mut frame)])
        };
        let saved_module = self.current_module.replace(Some(module));

        let result = self.run(&def.body).await;

        *self.scopes.borrow_mut() = saved_scopes;
        *self.current_module.borrow_mut() = saved_module;
        self.depth.set(self.depth.get() - 1);
        result
    }

    async fn text_argument(
        &self,
        function: &Arc<str>,
        arguments: &[Spanned<Expr>],
        index: usize,
        expected: usize,
    ) -> Result<String, ScriptError> {
        let argument = arguments.get(index).ok_or_else(|| ScriptError::Arity {
            function: function.clone(),
            expected,
            got: arguments.len(),
        })?;
        let value = self.eval_expr(argument).await?;
        value
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| ScriptError::Type(format!("{function} expects a text argument")))
    }
}

fn numeric_op(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    apply: impl Fn(f64, f64) -> f64,
) -> Result<Value, ScriptError> {
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok(Value::Number(apply(a, b))),
        _ => Err(ScriptError::Type(format!(
            "{op:?} expects numbers, got {left} and {right}"
        ))),
    }
}

fn ordering_op(
    left: &Value,
    right: &Value,
    accept: impl Fn(f64) -> bool,
) -> Result<Value, ScriptError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a - b,
        (Value::Text(a), Value::Text(b)) => match a.cmp(b) {
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => 1.0,
        },
        _ => {
            return Err(ScriptError::Type(format!(
                "cannot order {left} and {right}"
            )));
        }
    };
    Ok(Value::Bool(accept(ordering)))
}
