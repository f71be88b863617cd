//! Parsers for scripts, modules, transforms and field expressions.
//!
//! Built over the token stream from [`super::lexer`] with chumsky's pratt
//! combinators. Parse failures are rendered into labeled reports at the
//! boundary so callers only ever see a `ScriptError::Parse`.

use std::fmt;
use std::sync::Arc;

use ariadne::{Config, Label, Report, ReportKind, Source};
use chumsky::{input::ValueInput, pratt::*, prelude::*};

use super::ast::{
    BinaryOp, Expr, FunctionDef, ModuleItem, Script, Stmt, TransformDef, UnaryOp,
};
use super::lexer::{Token, lexer};
use super::{ParseError, Span, Spanned};
use crate::error::ScriptError;
use crate::store::FieldPath;
use crate::value::Value;

pub fn span_at(offset: usize) -> Span {
    (offset..offset).into()
}

fn expression<'src, I>()
-> impl Parser<'src, I, Spanned<Expr>, extra::Err<ParseError<'src, Token<'src>>>> + Clone
where
    I: ValueInput<'src, Token = Token<'src>, Span = Span>,
{
    recursive(|expression| {
        let identifier = select! { Token::Identifier(name) => name };

        let literal = select! {
            Token::Number(number) => Value::Number(number),
            Token::Text(text) => Value::text(text),
            Token::True => Value::Bool(true),
            Token::False => Value::Bool(false),
            Token::Null => Value::Null,
        };

        let arguments = expression
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(
                just(Token::BracketRoundOpen),
                just(Token::BracketRoundClose),
            );

        let call = identifier
            .then(arguments.clone())
            .map(|(function, arguments)| Expr::Call {
                function: Arc::from(function),
                arguments,
            });

        let field_ref = identifier
            .then(
                just(Token::Arrow)
                    .ignore_then(identifier)
                    .repeated()
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .map(|(root, hops)| {
                let segments = std::iter::once(root).chain(hops).map(Arc::from);
                Expr::FieldRef(FieldPath::from_segments(segments))
            });

        let list = expression
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect()
            .delimited_by(
                just(Token::BracketSquareOpen),
                just(Token::BracketSquareClose),
            )
            .map(|items| Expr::List(items));

        let nested = expression.clone().delimited_by(
            just(Token::BracketRoundOpen),
            just(Token::BracketRoundClose),
        );

        let atom = choice((
            literal.map(Expr::Literal),
            call,
            field_ref,
            identifier.map(|name| Expr::Ident(Arc::from(name))),
            list,
        ))
        .map_with(|node, extra| Spanned {
            node,
            span: extra.span(),
        })
        .or(nested);

        // Member access and module method calls: `obj.field`, `Module.f(x)`
        let suffix = just(Token::Dot)
            .ignore_then(identifier)
            .then(arguments.clone().or_not());

        let postfix = atom.then(suffix.repeated().collect::<Vec<_>>()).map_with(
            |(base, suffixes), extra| {
                suffixes
                    .into_iter()
                    .fold(base, |object, (name, arguments)| Spanned {
                        span: extra.span(),
                        node: match arguments {
                            Some(arguments) => Expr::MethodCall {
                                object: Box::new(object),
                                method: Arc::from(name),
                                arguments,
                            },
                            None => Expr::Member {
                                object: Box::new(object),
                                field: Arc::from(name),
                            },
                        },
                    })
            },
        );

        postfix.pratt((
            prefix(9, just(Token::Minus), |_, operand, extra| Spanned {
                span: extra.span(),
                node: Expr::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(operand),
                },
            }),
            prefix(9, just(Token::Not), |_, operand, extra| Spanned {
                span: extra.span(),
                node: Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            }),
            infix(left(7), just(Token::Asterisk), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Multiply,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(7), just(Token::Slash), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Divide,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(7), just(Token::Percent), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Modulo,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(6), just(Token::Plus), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Add,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(6), just(Token::Minus), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Subtract,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(4), just(Token::Equal), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Equal,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(4), just(Token::NotEqual), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::NotEqual,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(4), just(Token::Greater), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Greater,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(4), just(Token::GreaterOrEqual), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::GreaterOrEqual,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(4), just(Token::Less), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Less,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(4), just(Token::LessOrEqual), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::LessOrEqual,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(3), just(Token::And), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::And,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
            infix(left(2), just(Token::Or), |l, _, r, extra| Spanned {
                span: extra.span(),
                node: Expr::Binary {
                    op: BinaryOp::Or,
                    left: Box::new(l),
                    right: Box::new(r),
                },
            }),
        ))
    })
}

fn statements<'src, I>()
-> impl Parser<'src, I, Vec<Spanned<Stmt>>, extra::Err<ParseError<'src, Token<'src>>>> + Clone
where
    I: ValueInput<'src, Token = Token<'src>, Span = Span>,
{
    let expression = expression();

    recursive(|statement| {
        let identifier = select! { Token::Identifier(name) => name };

        let block = statement
            .clone()
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(
                just(Token::BracketCurlyOpen),
                just(Token::BracketCurlyClose),
            );

        let let_stmt = just(Token::Let)
            .ignore_then(identifier)
            .then_ignore(just(Token::Assign))
            .then(expression.clone())
            .then_ignore(just(Token::Semicolon))
            .map(|(name, value)| Stmt::Let {
                name: Arc::from(name),
                value,
            });

        let assign_stmt = identifier
            .then_ignore(just(Token::Assign))
            .then(expression.clone())
            .then_ignore(just(Token::Semicolon))
            .map(|(name, value)| Stmt::Assign {
                name: Arc::from(name),
                value,
            });

        let return_stmt = just(Token::Return)
            .ignore_then(expression.clone().or_not())
            .then_ignore(just(Token::Semicolon))
            .map(Stmt::Return);

        let if_stmt = recursive(|if_stmt| {
            just(Token::If)
                .ignore_then(expression.clone())
                .then(block.clone())
                .then(
                    just(Token::Else)
                        .ignore_then(choice((
                            block.clone(),
                            if_stmt.map_with(|node, extra| {
                                vec![Spanned {
                                    node,
                                    span: extra.span(),
                                }]
                            }),
                        )))
                        .or_not(),
                )
                .map(|((condition, then_block), else_block)| Stmt::If {
                    condition,
                    then_block,
                    else_block: else_block.unwrap_or_default(),
                })
        });

        let expr_stmt = expression
            .clone()
            .then_ignore(just(Token::Semicolon))
            .map(Stmt::Expr);

        choice((let_stmt, return_stmt, if_stmt, assign_stmt, expr_stmt)).map_with(
            |node, extra| Spanned {
                node,
                span: extra.span(),
            },
        )
    })
    .repeated()
    .collect()
}

fn script<'src, I>()
-> impl Parser<'src, I, Script, extra::Err<ParseError<'src, Token<'src>>>>
where
    I: ValueInput<'src, Token = Token<'src>, Span = Span>,
{
    statements()
        .then(expression().or_not())
        .map(|(statements, tail)| Script { statements, tail })
        .then_ignore(end())
}

fn module<'src, I>()
-> impl Parser<'src, I, Vec<ModuleItem>, extra::Err<ParseError<'src, Token<'src>>>>
where
    I: ValueInput<'src, Token = Token<'src>, Span = Span>,
{
    let identifier = select! { Token::Identifier(name) => name };

    let constant = just(Token::Let)
        .ignore_then(identifier)
        .then_ignore(just(Token::Assign))
        .then(expression())
        .then_ignore(just(Token::Semicolon))
        .map(|(name, value)| ModuleItem::Const {
            name: Arc::from(name),
            value,
        });

    let parameters = identifier
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(
            just(Token::BracketRoundOpen),
            just(Token::BracketRoundClose),
        );

    let body = statements()
        .then(expression().or_not())
        .delimited_by(
            just(Token::BracketCurlyOpen),
            just(Token::BracketCurlyClose),
        )
        .map(|(statements, tail)| Script { statements, tail });

    let function = just(Token::Fn)
        .ignore_then(identifier)
        .then(parameters)
        .then(body)
        .map(|((name, parameters), body)| {
            ModuleItem::Function(FunctionDef {
                name: Arc::from(name),
                parameters: parameters.into_iter().map(Arc::from).collect(),
                body,
            })
        });

    choice((constant, function))
        .repeated()
        .collect()
        .then_ignore(end())
}

fn transform<'src, I>()
-> impl Parser<'src, I, TransformDef, extra::Err<ParseError<'src, Token<'src>>>>
where
    I: ValueInput<'src, Token = Token<'src>, Span = Span>,
{
    let identifier = select! { Token::Identifier(name) => name };

    let arrow = identifier
        .then_ignore(just(Token::Implies))
        .then(expression())
        .then_ignore(end())
        .map(|(parameter, body)| TransformDef::Arrow {
            parameter: Arc::from(parameter),
            body,
        });

    let block = statements()
        .then(expression().or_not())
        .then_ignore(end())
        .map(|(statements, tail)| TransformDef::Block(Script { statements, tail }));

    arrow.or(block)
}

macro_rules! parse_entry {
    ($source:expr, $context:expr, $parser:expr) => {{
        let (tokens, lex_errors) = lexer().parse($source).into_output_errors();
        if !lex_errors.is_empty() {
            return Err(parse_failure($context, $source, &lex_errors));
        }
        let mut tokens = tokens.unwrap_or_default();
        tokens.retain(|token| !matches!(token.node, Token::Comment(_)));
        let input = tokens.map(span_at($source.len()), |Spanned { node, span }| {
            (node, span)
        });
        let (output, parse_errors) = $parser.parse(input).into_output_errors();
        if !parse_errors.is_empty() {
            return Err(parse_failure($context, $source, &parse_errors));
        }
        output.ok_or_else(|| ScriptError::Parse {
            context: $context.to_string(),
            message: "empty parse output".to_string(),
        })
    }};
}

/// Parse a script body (statements plus optional trailing expression).
pub fn parse_script(source: &str, context: &str) -> Result<Script, ScriptError> {
    parse_entry!(source, context, script())
}

/// Parse a script module: top-level `let` constants and `fn` definitions.
pub fn parse_module(source: &str, context: &str) -> Result<Vec<ModuleItem>, ScriptError> {
    parse_entry!(source, context, module())
}

/// Parse a binding transform: arrow form or statement body.
pub fn parse_transform(source: &str, context: &str) -> Result<TransformDef, ScriptError> {
    parse_entry!(source, context, transform())
}

/// Parse a single field-mode expression.
pub fn parse_expression(source: &str, context: &str) -> Result<Spanned<Expr>, ScriptError> {
    parse_entry!(source, context, expression().then_ignore(end()))
}

fn parse_failure<T: fmt::Display>(
    context: &str,
    source: &str,
    errors: &[ParseError<'_, T>],
) -> ScriptError {
    let mut rendered = String::new();
    for error in errors {
        let span = error.span();
        let mut buffer = Vec::new();
        let report = Report::build(ReportKind::Error, (context, span.start..span.end))
            .with_config(Config::default().with_color(false))
            .with_message(error.to_string())
            .with_label(
                Label::new((context, span.start..span.end)).with_message(error.reason().to_string()),
            )
            .finish()
            .write((context, Source::from(source)), &mut buffer);
        match report {
            Ok(()) => rendered.push_str(&String::from_utf8_lossy(&buffer)),
            Err(_) => rendered.push_str(&error.to_string()),
        }
    }
    ScriptError::Parse {
        context: context.to_string(),
        message: rendered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arrow_transform() {
        let transform = parse_transform("value => clamp(value, 0, 100)", "test").unwrap();
        assert!(matches!(transform, TransformDef::Arrow { .. }));
    }

    #[test]
    fn parses_block_transform() {
        let transform =
            parse_transform("let scaled = value * 10; return scaled;", "test").unwrap();
        assert!(matches!(transform, TransformDef::Block(_)));
    }

    #[test]
    fn parses_field_expression_with_indirection() {
        let expression = parse_expression("Pump->Motor->Speed", "test").unwrap();
        match expression.node {
            Expr::FieldRef(path) => assert_eq!(path.segments().len(), 3),
            other => panic!("expected field reference, got {other:?}"),
        }
    }

    #[test]
    fn parses_script_with_state_and_conditionals() {
        let source = r#"
            let current = get("Temperature");
            let previous = getState("last");
            if current > previous {
                setState("last", current);
            }
            current - previous
        "#;
        let script = parse_script(source, "test").unwrap();
        assert_eq!(script.statements.len(), 3);
        assert!(script.tail.is_some());
    }

    #[test]
    fn parses_module_items() {
        let source = r#"
            let max_rpm = 1450;
            fn percent(actual) {
                actual / max_rpm * 100
            }
        "#;
        let items = parse_module(source, "test").unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], ModuleItem::Const { .. }));
        assert!(matches!(items[1], ModuleItem::Function(_)));
    }

    #[test]
    fn rejects_malformed_source() {
        assert!(parse_script("let = ;", "test").is_err());
        assert!(parse_expression("a +", "test").is_err());
    }

    #[test]
    fn module_method_calls_parse() {
        let expression = parse_expression("Colors.ramp(level / 100)", "test").unwrap();
        assert!(matches!(expression.node, Expr::MethodCall { .. }));
    }
}
