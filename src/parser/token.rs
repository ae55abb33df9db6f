use std::iter::{Enumerate, Peekable};
use std::str::{Chars, FromStr};

use anyhow::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    And,
    Asc,
    Begin,
    Bigint,
    By,
    Char,
    Commit,
    Create,
    Delete,
    Desc,
    Double,
    Drop,
    Float,
    From,
    Insert,
    Int,
    Integer,
    Into,
    Key,
    Not,
    Or,
    Order,
    Primary,
    Rollback,
    Select,
    Set,
    Table,
    Text,
    Update,
    Values,
    Where,
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let res = match s {
            "and" => Self::And,
            "asc" => Self::Asc,
            "begin" => Self::Begin,
            "bigint" => Self::Bigint,
            "by" => Self::By,
            "char" => Self::Char,
            "commit" => Self::Commit,
            "create" => Self::Create,
            "delete" => Self::Delete,
            "desc" => Self::Desc,
            "double" => Self::Double,
            "drop" => Self::Drop,
            "float" => Self::Float,
            "from" => Self::From,
            "insert" => Self::Insert,
            "int" => Self::Int,
            "integer" => Self::Integer,
            "into" => Self::Into,
            "key" => Self::Key,
            "not" => Self::Not,
            "or" => Self::Or,
            "order" => Self::Order,
            "primary" => Self::Primary,
            "rollback" => Self::Rollback,
            "select" => Self::Select,
            "set" => Self::Set,
            "table" => Self::Table,
            "text" => Self::Text,
            "update" => Self::Update,
            "values" => Self::Values,
            "where" => Self::Where,
            _ => return Err(()),
        };
        Ok(res)
    }
}

#[derive(Debug, PartialEq)]
pub enum Token {
    /// an SQL identifier
    Identifier(String),
    /// a keyword (e.g. CREATE)
    Keyword(Keyword),
    /// a number, like 123 or 1.5
    Number(String),
    /// a quoted string
    QuotedString(String),
    /// Comma ','
    Comma,
    /// Left parenthesis '('
    LeftParen,
    /// Right parenthesis ')'
    RightParen,
    /// star '*'
    Star,
    /// Minus '-'
    Minus,
    /// Plus '+'
    Plus,
    /// Division '/'
    Division,
    /// Equal '='
    Eq,
    /// Not equal (either '<>' or '!=')
    NotEq,
    /// Less than '<'
    Less,
    /// Greater than '>'
    Greater,
    /// Less than or equal '<='
    LessEq,
    /// Greater than or equal '>='
    GreaterEq,
    /// not a token, just end of query
    End,
}

struct Tokenizer<'a> {
    sql: &'a str,
    chars: Peekable<Enumerate<Chars<'a>>>,
}

impl<'a> Tokenizer<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            sql,
            chars: sql.chars().enumerate().peekable(),
        }
    }

    fn word(&mut self, start: usize) -> String {
        let mut end = start + 1;
        while let Some((pos, ch)) = self.chars.peek() {
            if ch.is_ascii_alphanumeric() || *ch == '_' {
                end = *pos + 1;
                self.chars.next();
                continue;
            } else {
                break;
            }
        }
        self.sql[start..end].to_lowercase()
    }

    fn number(&mut self, start: usize) -> String {
        let mut end = start + 1;
        let mut seen_dot = false;
        while let Some((pos, ch)) = self.chars.peek() {
            if ch.is_ascii_digit() || (*ch == '.' && !seen_dot) {
                seen_dot |= *ch == '.';
                end = *pos + 1;
                self.chars.next();
                continue;
            } else {
                break;
            }
        }
        self.sql[start..end].to_owned()
    }

    fn quoted_string(&mut self, start: usize) -> Result<String> {
        for (pos, ch) in self.chars.by_ref() {
            if ch == '\'' {
                return Ok(self.sql[start..pos].to_owned());
            }
        }

        Err(Error::msg(format!(
            "Unterminated string literal {}",
            &self.sql[start..]
        )))
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        let token = match self.chars.next() {
            Some((pos, ch)) => match ch {
                ch if ch.is_whitespace() => return self.next_token(),
                '(' => Token::LeftParen,
                ')' => Token::RightParen,
                ',' => Token::Comma,
                '*' => Token::Star,
                '+' => Token::Plus,
                '-' => Token::Minus,
                '/' => Token::Division,
                '!' => match self.chars.peek() {
                    Some((_pos, '=')) => {
                        self.chars.next();
                        Token::NotEq
                    }
                    _ => return Err(Error::msg("Unexpected character '!'")),
                },
                '=' => Token::Eq,
                '<' => match self.chars.peek() {
                    Some((_pos, '>')) => {
                        self.chars.next();
                        Token::NotEq
                    }
                    Some((_pos, '=')) => {
                        self.chars.next();
                        Token::LessEq
                    }
                    _ => Token::Less,
                },
                '>' => match self.chars.peek() {
                    Some((_pos, '=')) => {
                        self.chars.next();
                        Token::GreaterEq
                    }
                    _ => Token::Greater,
                },
                '\'' => Token::QuotedString(self.quoted_string(pos + 1)?),
                'a'..='z' | 'A'..='Z' | '_' => {
                    let word = self.word(pos);
                    if let Ok(keyword) = Keyword::from_str(&word) {
                        Token::Keyword(keyword)
                    } else {
                        Token::Identifier(word)
                    }
                }
                '0'..='9' => Token::Number(self.number(pos)),
                ch => return Err(Error::msg(format!("Unexpected character '{ch}'"))),
            },
            None => return Ok(None),
        };

        Ok(Some(token))
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut tokenizer = Tokenizer::new(sql);
    while let Some(token) = tokenizer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}
