use std::borrow::Cow;
use std::fmt;

use chumsky::prelude::*;

use super::{ParseError, Spanned};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'src> {
    BracketRoundOpen,
    BracketRoundClose,
    BracketCurlyOpen,
    BracketCurlyClose,
    BracketSquareOpen,
    BracketSquareClose,
    Comma,
    Semicolon,
    Dot,
    /// Indirection hop: `Pump->Speed`
    Arrow,
    /// Arrow transform: `value => value * 2`
    Implies,
    Assign,
    NotEqual,
    GreaterOrEqual,
    Greater,
    LessOrEqual,
    Less,
    Equal,
    Plus,
    Minus,
    Asterisk,
    Slash,
    Percent,
    And,
    Or,
    Not,
    Comment(&'src str),
    Number(f64),
    Text(&'src str),
    Identifier(&'src str),
    Let,
    If,
    Else,
    Return,
    Fn,
    True,
    False,
    Null,
}

impl<'src> Token<'src> {
    pub fn into_cow_str(self) -> Cow<'src, str> {
        match self {
            Self::BracketRoundOpen => "(".into(),
            Self::BracketRoundClose => ")".into(),
            Self::BracketCurlyOpen => "{".into(),
            Self::BracketCurlyClose => "}".into(),
            Self::BracketSquareOpen => "[".into(),
            Self::BracketSquareClose => "]".into(),
            Self::Comma => ",".into(),
            Self::Semicolon => ";".into(),
            Self::Dot => ".".into(),
            Self::Arrow => "->".into(),
            Self::Implies => "=>".into(),
            Self::Assign => "=".into(),
            Self::NotEqual => "!=".into(),
            Self::GreaterOrEqual => ">=".into(),
            Self::Greater => ">".into(),
            Self::LessOrEqual => "<=".into(),
            Self::Less => "<".into(),
            Self::Equal => "==".into(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::Asterisk => "*".into(),
            Self::Slash => "/".into(),
            Self::Percent => "%".into(),
            Self::And => "&&".into(),
            Self::Or => "||".into(),
            Self::Not => "!".into(),
            Self::Comment(comment) => comment.into(),
            Self::Number(number) => number.to_string().into(),
            Self::Text(text) => text.into(),
            Self::Identifier(identifier) => identifier.into(),
            Self::Let => "let".into(),
            Self::If => "if".into(),
            Self::Else => "else".into(),
            Self::Return => "return".into(),
            Self::Fn => "fn".into(),
            Self::True => "true".into(),
            Self::False => "false".into(),
            Self::Null => "null".into(),
        }
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.into_cow_str())
    }
}

pub fn lexer<'src>()
-> impl Parser<'src, &'src str, Vec<Spanned<Token<'src>>>, extra::Err<ParseError<'src, char>>> {
    let bracket = choice((
        just('(').to(Token::BracketRoundOpen),
        just(')').to(Token::BracketRoundClose),
        just('{').to(Token::BracketCurlyOpen),
        just('}').to(Token::BracketCurlyClose),
        just('[').to(Token::BracketSquareOpen),
        just(']').to(Token::BracketSquareClose),
    ));

    let comment = just("//")
        .then(none_of('\n').repeated())
        .to_slice()
        .map(Token::Comment);

    let operator = choice((
        just("=>").to(Token::Implies),
        just("->").to(Token::Arrow),
        just("==").to(Token::Equal),
        just("!=").to(Token::NotEqual),
        just(">=").to(Token::GreaterOrEqual),
        just("<=").to(Token::LessOrEqual),
        just("&&").to(Token::And),
        just("||").to(Token::Or),
        just('>').to(Token::Greater),
        just('<').to(Token::Less),
        just('=').to(Token::Assign),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Asterisk),
        just('/').to(Token::Slash),
        just('%').to(Token::Percent),
        just('!').to(Token::Not),
        just(',').to(Token::Comma),
        just(';').to(Token::Semicolon),
        just('.').to(Token::Dot),
    ));

    let number = text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .to_slice()
        .from_str()
        .unwrapped()
        .map(Token::Number);

    let double_quoted = just('"')
        .ignore_then(none_of('"').repeated().to_slice())
        .then_ignore(just('"'))
        .map(Token::Text);

    let single_quoted = just('\'')
        .ignore_then(none_of('\'').repeated().to_slice())
        .then_ignore(just('\''))
        .map(Token::Text);

    let identifier = any()
        .filter(|character: &char| character.is_ascii_alphabetic() || *character == '_')
        .then(
            any()
                .filter(|character: &char| {
                    character.is_ascii_alphanumeric() || *character == '_'
                })
                .repeated(),
        )
        .to_slice()
        .map(|identifier: &'src str| match identifier {
            "let" => Token::Let,
            "if" => Token::If,
            "else" => Token::Else,
            "return" => Token::Return,
            "fn" => Token::Fn,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Identifier(identifier),
        });

    let token = choice((
        comment,
        bracket,
        number,
        double_quoted,
        single_quoted,
        operator,
        identifier,
    ));

    token
        .map_with(|token, extra| Spanned {
            node: token,
            span: extra.span(),
        })
        .padded_by(text::whitespace())
        .recover_with(skip_then_retry_until(any().ignored(), end()))
        .repeated()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chumsky::prelude::Parser;

    fn tokens(source: &str) -> Vec<Token<'_>> {
        lexer()
            .parse(source)
            .output()
            .unwrap()
            .iter()
            .map(|token| token.node)
            .collect()
    }

    #[test]
    fn lexes_arrow_paths() {
        assert_eq!(
            tokens("Pump->Speed"),
            vec![
                Token::Identifier("Pump"),
                Token::Arrow,
                Token::Identifier("Speed"),
            ]
        );
    }

    #[test]
    fn lexes_arrow_transform() {
        assert_eq!(
            tokens("value => value * 2"),
            vec![
                Token::Identifier("value"),
                Token::Implies,
                Token::Identifier("value"),
                Token::Asterisk,
                Token::Number(2.0),
            ]
        );
    }

    #[test]
    fn keywords_and_strings() {
        assert_eq!(
            tokens("let label = 'Tank A';"),
            vec![
                Token::Let,
                Token::Identifier("label"),
                Token::Assign,
                Token::Text("Tank A"),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn comments_are_tokens() {
        let all = tokens("1 // trailing note");
        assert_eq!(all[0], Token::Number(1.0));
        assert!(matches!(all[1], Token::Comment(_)));
    }
}
