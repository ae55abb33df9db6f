use std::fmt::Display;

use crate::types::{DataType, TupleFormat};

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnaryOperator {
    Minus,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinaryOperator {
    Plus,
    Minus,
    Multiply,
    Divide,
    Less,
    LessEq,
    Eq,
    GreaterEq,
    Greater,
    NotEq,
    And,
    Or,
}

impl Display for BinaryOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plus => write!(f, "+"),
            Self::Minus => write!(f, "-"),
            Self::Multiply => write!(f, "*"),
            Self::Divide => write!(f, "/"),
            Self::Less => write!(f, "<"),
            Self::LessEq => write!(f, "<="),
            Self::Eq => write!(f, "="),
            Self::GreaterEq => write!(f, ">="),
            Self::Greater => write!(f, ">"),
            Self::NotEq => write!(f, "<>"),
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

/// Annotation slots the semantic analyzer fills in. Everything downstream
/// of the analyzer reads these instead of re-resolving names.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExprSem {
    /// Index of the referenced column within its relation; 0 is the key.
    pub column_index: Option<usize>,
    pub resolved_type: Option<DataType>,
    /// Name of the relation the column reference was resolved against.
    pub relation: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub sem: ExprSem,
}

impl ExprNode {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            kind,
            sem: ExprSem::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Column(String),
    Literal(Literal),
    Binary {
        op: BinaryOperator,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Unary {
        op: UnaryOperator,
        expr: Box<ExprNode>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: DataType,
    pub primary_key: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    Wildcard,
    Column(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub desc: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectSem {
    /// Column indices produced in output order.
    pub column_indices: Vec<usize>,
    /// Index of the ORDER BY column when one is present.
    pub order_by_index: usize,
    /// Layout of the ephemeral tree rows: ORDER BY key first, then every
    /// projected column.
    pub rb_format: Option<TupleFormat>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    pub projections: Vec<Projection>,
    pub filter: Option<ExprNode>,
    pub order_by: Option<OrderBy>,
    pub sem: SelectSem,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InsertSem {
    /// Target column index for each VALUES expression, in order.
    pub column_indices: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    /// Explicit column list; empty means every column in table order.
    pub columns: Vec<String>,
    pub values: Vec<ExprNode>,
    pub sem: InsertSem,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: ExprNode,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateSem {
    pub column_indices: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<Assignment>,
    pub filter: Option<ExprNode>,
    pub sem: UpdateSem,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub filter: Option<ExprNode>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateTableStatement {
    pub table: String,
    pub columns: Vec<ColumnDef>,
    /// Original statement text, persisted in the master catalog.
    pub sql: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DropTableStatement {
    pub table: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    CreateTable(CreateTableStatement),
    DropTable(DropTableStatement),
    Begin,
    Commit,
    Rollback,
}
