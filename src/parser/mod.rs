use std::iter::Peekable;
use std::vec::IntoIter;

use anyhow::{Error, Result};

use self::ast::{
    Assignment, BinaryOperator, ColumnDef, CreateTableStatement, DeleteStatement,
    DropTableStatement, ExprKind, ExprNode, InsertSem, InsertStatement, Literal, OrderBy,
    Projection, SelectSem, SelectStatement, Statement, UnaryOperator, UpdateSem, UpdateStatement,
};
use self::token::{tokenize, Keyword, Token};
use crate::types::DataType;

pub mod ast;
mod token;

/// Parses a possibly multi-statement input. Statements are separated by
/// semicolons; a trailing semicolon is optional.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let mut statements = vec![];
    for piece in split_statements(sql) {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parser = Parser::new(trimmed)?;
        statements.push(parser.parse_statement(trimmed)?);
    }
    Ok(statements)
}

/// Splits on semicolons outside of string literals.
fn split_statements(sql: &str) -> Vec<&str> {
    let mut pieces = vec![];
    let mut start = 0;
    let mut in_string = false;
    for (pos, ch) in sql.char_indices() {
        match ch {
            '\'' => in_string = !in_string,
            ';' if !in_string => {
                pieces.push(&sql[start..pos]);
                start = pos + 1;
            }
            _ => (),
        }
    }
    pieces.push(&sql[start..]);
    pieces
}

pub struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    fn new(sql: &str) -> Result<Self> {
        let tokens = tokenize(sql)?;
        Ok(Self {
            tokens: tokens.into_iter().peekable(),
        })
    }

    fn next_token(&mut self) -> Token {
        match self.tokens.next() {
            Some(token) => token,
            None => Token::End,
        }
    }

    fn peek_token(&mut self) -> &Token {
        match self.tokens.peek() {
            Some(token) => token,
            None => &Token::End,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let found = self.next_token();
        if found != expected {
            return Err(Error::msg(format!(
                "Expected {:?} but found {:?}",
                expected, found
            )));
        }
        Ok(())
    }

    fn expect_keyword(&mut self, expected: Keyword) -> Result<()> {
        self.expect(Token::Keyword(expected))
    }

    fn accept_keyword(&mut self, keyword: Keyword) -> bool {
        if self.peek_token() == &Token::Keyword(keyword) {
            self.next_token();
            true
        } else {
            false
        }
    }

    fn wrong_token<T>(&self, expected: &str, found: Token) -> Result<T> {
        Err(Error::msg(format!(
            "Expected {} but found {:?}",
            expected, found
        )))
    }

    fn parse_identifier(&mut self) -> Result<String> {
        match self.next_token() {
            Token::Identifier(name) => Ok(name),
            found => self.wrong_token("an identifier", found),
        }
    }

    fn parse_statement(&mut self, sql: &str) -> Result<Statement> {
        let statement = match self.next_token() {
            Token::Keyword(keyword) => match keyword {
                Keyword::Create => self.parse_create_table(sql)?,
                Keyword::Drop => self.parse_drop_table()?,
                Keyword::Select => self.parse_select()?,
                Keyword::Insert => self.parse_insert()?,
                Keyword::Update => self.parse_update()?,
                Keyword::Delete => self.parse_delete()?,
                Keyword::Begin => Statement::Begin,
                Keyword::Commit => Statement::Commit,
                Keyword::Rollback => Statement::Rollback,
                found => return self.wrong_token("a statement", Token::Keyword(found)),
            },
            found => return self.wrong_token("a statement", found),
        };
        match self.next_token() {
            Token::End => Ok(statement),
            found => self.wrong_token("end of statement", found),
        }
    }

    fn parse_create_table(&mut self, sql: &str) -> Result<Statement> {
        self.expect_keyword(Keyword::Table)?;
        let table = self.parse_identifier()?;
        self.expect(Token::LeftParen)?;

        let mut columns = vec![];
        loop {
            columns.push(self.parse_column_definition()?);
            match self.next_token() {
                Token::Comma => continue,
                Token::RightParen => break,
                found => return self.wrong_token("',' or ')'", found),
            }
        }

        Ok(Statement::CreateTable(CreateTableStatement {
            table,
            columns,
            sql: sql.to_owned(),
        }))
    }

    fn parse_column_definition(&mut self) -> Result<ColumnDef> {
        let name = self.parse_identifier()?;
        let ty = self.parse_data_type()?;
        let primary_key = if self.accept_keyword(Keyword::Primary) {
            self.expect_keyword(Keyword::Key)?;
            true
        } else {
            false
        };
        Ok(ColumnDef {
            name,
            ty,
            primary_key,
        })
    }

    fn parse_data_type(&mut self) -> Result<DataType> {
        match self.next_token() {
            Token::Keyword(Keyword::Int) | Token::Keyword(Keyword::Integer) => Ok(DataType::U32),
            Token::Keyword(Keyword::Bigint) => Ok(DataType::U64),
            Token::Keyword(Keyword::Float) => Ok(DataType::F32),
            Token::Keyword(Keyword::Double) => Ok(DataType::F64),
            Token::Keyword(Keyword::Text) => Ok(DataType::Char32),
            Token::Keyword(Keyword::Char) => {
                self.expect(Token::LeftParen)?;
                let width = match self.next_token() {
                    Token::Number(num) => num
                        .parse::<usize>()
                        .map_err(|_| Error::msg(format!("Invalid CHAR width {}", num)))?,
                    found => return self.wrong_token("a CHAR width", found),
                };
                self.expect(Token::RightParen)?;
                DataType::char_of_width(width).ok_or_else(|| {
                    Error::msg(format!(
                        "CHAR width {} is not supported; use 8, 16, 32, 64, 128 or 256",
                        width
                    ))
                })
            }
            found => self.wrong_token("a data type", found),
        }
    }

    fn parse_drop_table(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::Table)?;
        let table = self.parse_identifier()?;
        Ok(Statement::DropTable(DropTableStatement { table }))
    }

    fn parse_select(&mut self) -> Result<Statement> {
        let projections = self.parse_projections()?;
        self.expect_keyword(Keyword::From)?;
        let table = self.parse_identifier()?;

        let filter = if self.accept_keyword(Keyword::Where) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let order_by = if self.accept_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            let column = self.parse_identifier()?;
            let desc = if self.accept_keyword(Keyword::Desc) {
                true
            } else {
                self.accept_keyword(Keyword::Asc);
                false
            };
            Some(OrderBy { column, desc })
        } else {
            None
        };

        Ok(Statement::Select(SelectStatement {
            table,
            projections,
            filter,
            order_by,
            sem: SelectSem::default(),
        }))
    }

    fn parse_projections(&mut self) -> Result<Vec<Projection>> {
        if self.peek_token() == &Token::Star {
            self.next_token();
            return Ok(vec![Projection::Wildcard]);
        }
        let mut projections = vec![];
        loop {
            projections.push(Projection::Column(self.parse_identifier()?));
            if self.peek_token() == &Token::Comma {
                self.next_token();
            } else {
                break;
            }
        }
        Ok(projections)
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::Into)?;
        let table = self.parse_identifier()?;

        let mut columns = vec![];
        if self.peek_token() == &Token::LeftParen {
            self.next_token();
            loop {
                columns.push(self.parse_identifier()?);
                match self.next_token() {
                    Token::Comma => continue,
                    Token::RightParen => break,
                    found => return self.wrong_token("',' or ')'", found),
                }
            }
        }

        self.expect_keyword(Keyword::Values)?;
        self.expect(Token::LeftParen)?;
        let mut values = vec![];
        loop {
            values.push(self.parse_expression()?);
            match self.next_token() {
                Token::Comma => continue,
                Token::RightParen => break,
                found => return self.wrong_token("',' or ')'", found),
            }
        }

        Ok(Statement::Insert(InsertStatement {
            table,
            columns,
            values,
            sem: InsertSem::default(),
        }))
    }

    fn parse_update(&mut self) -> Result<Statement> {
        let table = self.parse_identifier()?;
        self.expect_keyword(Keyword::Set)?;

        let mut assignments = vec![];
        loop {
            let column = self.parse_identifier()?;
            self.expect(Token::Eq)?;
            let value = self.parse_expression()?;
            assignments.push(Assignment { column, value });
            if self.peek_token() == &Token::Comma {
                self.next_token();
            } else {
                break;
            }
        }

        let filter = if self.accept_keyword(Keyword::Where) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(Statement::Update(UpdateStatement {
            table,
            assignments,
            filter,
            sem: UpdateSem::default(),
        }))
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect_keyword(Keyword::From)?;
        let table = self.parse_identifier()?;
        let filter = if self.accept_keyword(Keyword::Where) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteStatement { table, filter }))
    }

    // Expression grammar, loosest binding first:
    // or > and > comparison > additive > multiplicative > unary > primary
    fn parse_expression(&mut self) -> Result<ExprNode> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_and()?;
        while self.accept_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            left = binary(BinaryOperator::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_not()?;
        while self.accept_keyword(Keyword::And) {
            let right = self.parse_not()?;
            left = binary(BinaryOperator::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<ExprNode> {
        if self.accept_keyword(Keyword::Not) {
            let expr = self.parse_not()?;
            return Ok(ExprNode::new(ExprKind::Unary {
                op: UnaryOperator::Not,
                expr: Box::new(expr),
            }));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<ExprNode> {
        let left = self.parse_additive()?;
        let op = match self.peek_token() {
            Token::Eq => BinaryOperator::Eq,
            Token::NotEq => BinaryOperator::NotEq,
            Token::Less => BinaryOperator::Less,
            Token::LessEq => BinaryOperator::LessEq,
            Token::Greater => BinaryOperator::Greater,
            Token::GreaterEq => BinaryOperator::GreaterEq,
            _ => return Ok(left),
        };
        self.next_token();
        let right = self.parse_additive()?;
        Ok(binary(op, left, right))
    }

    fn parse_additive(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_token() {
                Token::Plus => BinaryOperator::Plus,
                Token::Minus => BinaryOperator::Minus,
                _ => return Ok(left),
            };
            self.next_token();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<ExprNode> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_token() {
                Token::Star => BinaryOperator::Multiply,
                Token::Division => BinaryOperator::Divide,
                _ => return Ok(left),
            };
            self.next_token();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<ExprNode> {
        if self.peek_token() == &Token::Minus {
            self.next_token();
            let expr = self.parse_unary()?;
            return Ok(ExprNode::new(ExprKind::Unary {
                op: UnaryOperator::Minus,
                expr: Box::new(expr),
            }));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ExprNode> {
        match self.next_token() {
            Token::Identifier(name) => Ok(ExprNode::new(ExprKind::Column(name))),
            Token::Number(num) => {
                let literal = if num.contains('.') {
                    Literal::Float(
                        num.parse()
                            .map_err(|_| Error::msg(format!("Invalid number {}", num)))?,
                    )
                } else {
                    Literal::Integer(
                        num.parse()
                            .map_err(|_| Error::msg(format!("Invalid number {}", num)))?,
                    )
                };
                Ok(ExprNode::new(ExprKind::Literal(literal)))
            }
            Token::QuotedString(text) => {
                Ok(ExprNode::new(ExprKind::Literal(Literal::String(text))))
            }
            Token::LeftParen => {
                let expr = self.parse_expression()?;
                self.expect(Token::RightParen)?;
                Ok(expr)
            }
            found => self.wrong_token("an expression", found),
        }
    }
}

fn binary(op: BinaryOperator, left: ExprNode, right: ExprNode) -> ExprNode {
    ExprNode::new(ExprKind::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}
