use anyhow::{Error, Result};

use crate::catalog::{Catalog, Relation};
use crate::common::MASTER_CATALOG_NAME;
use crate::parser::ast::{
    BinaryOperator, CreateTableStatement, DeleteStatement, DropTableStatement, ExprKind, ExprNode,
    InsertStatement, Literal, Projection, SelectStatement, Statement, UnaryOperator,
    UpdateStatement,
};
use crate::types::{DataType, TupleFormat};

/// Semantic pass over a parsed statement. Resolves every table and column
/// reference against the catalog and writes the results into the AST's
/// `sem` payloads; the compiler reads only those annotations.
pub struct Analyzer<'a> {
    catalog: &'a Catalog,
}

impl<'a> Analyzer<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn analyze(&self, statement: &mut Statement) -> Result<()> {
        match statement {
            Statement::Select(select) => self.analyze_select(select),
            Statement::Insert(insert) => self.analyze_insert(insert),
            Statement::Update(update) => self.analyze_update(update),
            Statement::Delete(delete) => self.analyze_delete(delete),
            Statement::CreateTable(create) => self.analyze_create_table(create),
            Statement::DropTable(drop) => self.analyze_drop_table(drop),
            Statement::Begin | Statement::Commit | Statement::Rollback => Ok(()),
        }
    }

    fn analyze_select(&self, select: &mut SelectStatement) -> Result<()> {
        let relation = self.catalog.require(&select.table)?;

        let mut column_indices = vec![];
        for projection in &select.projections {
            match projection {
                Projection::Wildcard => column_indices.extend(0..relation.columns.len()),
                Projection::Column(name) => column_indices.push(resolve_column(relation, name)?),
            }
        }

        if let Some(filter) = &mut select.filter {
            self.analyze_expr(filter, relation, None)?;
        }

        if let Some(order_by) = &select.order_by {
            let order_index = resolve_column(relation, &order_by.column)?;
            // The ephemeral tree's rows are keyed by the ORDER BY column
            // followed by every projected column.
            let mut types = vec![relation.columns[order_index].ty];
            for &col in &column_indices {
                types.push(relation.columns[col].ty);
            }
            select.sem.order_by_index = order_index;
            select.sem.rb_format = Some(TupleFormat::from_columns(&types));
        }

        select.sem.column_indices = column_indices;
        Ok(())
    }

    fn analyze_insert(&self, insert: &mut InsertStatement) -> Result<()> {
        let relation = self.catalog.require(&insert.table)?;
        self.reject_master_mutation(&insert.table)?;

        let column_indices: Vec<usize> = if insert.columns.is_empty() {
            if insert.values.len() != relation.columns.len() {
                return Err(Error::msg(format!(
                    "table {} has {} columns but {} values were supplied",
                    insert.table,
                    relation.columns.len(),
                    insert.values.len()
                )));
            }
            (0..relation.columns.len()).collect()
        } else {
            if insert.values.len() != insert.columns.len() {
                return Err(Error::msg(format!(
                    "{} columns listed but {} values supplied",
                    insert.columns.len(),
                    insert.values.len()
                )));
            }
            let mut indices = vec![];
            for name in &insert.columns {
                let index = resolve_column(relation, name)?;
                if indices.contains(&index) {
                    return Err(Error::msg(format!("column {} listed twice", name)));
                }
                indices.push(index);
            }
            indices
        };

        for (value, &col_index) in insert.values.iter_mut().zip(&column_indices) {
            fold_signed_literal(value);
            let target_type = relation.columns[col_index].ty;
            self.analyze_expr(value, relation, Some(target_type))?;
            if !matches!(value.kind, ExprKind::Literal(_)) {
                return Err(Error::msg("INSERT values must be literals"));
            }
        }

        insert.sem.column_indices = column_indices;
        Ok(())
    }

    fn analyze_update(&self, update: &mut UpdateStatement) -> Result<()> {
        let relation = self.catalog.require(&update.table)?;
        self.reject_master_mutation(&update.table)?;

        let mut column_indices = vec![];
        for assignment in &mut update.assignments {
            let index = resolve_column(relation, &assignment.column)?;
            if index == 0 {
                return Err(Error::msg(format!(
                    "cannot update primary key column {}",
                    assignment.column
                )));
            }
            if column_indices.contains(&index) {
                return Err(Error::msg(format!(
                    "column {} assigned twice",
                    assignment.column
                )));
            }
            fold_signed_literal(&mut assignment.value);
            let target_type = relation.columns[index].ty;
            self.analyze_expr(&mut assignment.value, relation, Some(target_type))?;
            if !matches!(assignment.value.kind, ExprKind::Literal(_)) {
                return Err(Error::msg("UPDATE values must be literals"));
            }
            column_indices.push(index);
        }

        if let Some(filter) = &mut update.filter {
            self.analyze_expr(filter, relation, None)?;
        }

        update.sem.column_indices = column_indices;
        Ok(())
    }

    fn analyze_delete(&self, delete: &mut DeleteStatement) -> Result<()> {
        let relation = self.catalog.require(&delete.table)?;
        self.reject_master_mutation(&delete.table)?;
        if let Some(filter) = &mut delete.filter {
            self.analyze_expr(filter, relation, None)?;
        }
        Ok(())
    }

    fn analyze_create_table(&self, create: &CreateTableStatement) -> Result<()> {
        if self.catalog.contains(&create.table) {
            return Err(Error::msg(format!(
                "table {} already exists",
                create.table
            )));
        }
        if create.table.len() >= DataType::Char32.size() {
            return Err(Error::msg(format!(
                "table name {} is too long",
                create.table
            )));
        }
        if create.sql.len() >= DataType::Char256.size() {
            return Err(Error::msg("CREATE TABLE statement text is too long"));
        }
        if create.columns.is_empty() {
            return Err(Error::msg("a table needs at least one column"));
        }
        for (i, col) in create.columns.iter().enumerate() {
            if create.columns[..i].iter().any(|other| other.name == col.name) {
                return Err(Error::msg(format!("duplicate column name {}", col.name)));
            }
            // The first column is the key whether or not it is marked;
            // marking any other column is an error.
            if col.primary_key && i != 0 {
                return Err(Error::msg(
                    "only the first column can be the primary key",
                ));
            }
        }
        Ok(())
    }

    fn analyze_drop_table(&self, drop: &DropTableStatement) -> Result<()> {
        self.catalog.require(&drop.table)?;
        self.reject_master_mutation(&drop.table)
    }

    fn reject_master_mutation(&self, table: &str) -> Result<()> {
        if table == MASTER_CATALOG_NAME {
            return Err(Error::msg("the master catalog cannot be modified directly"));
        }
        Ok(())
    }

    /// Resolves column references and types literals. `hint` carries the
    /// column type a literal is being compared to or stored into.
    fn analyze_expr(
        &self,
        expr: &mut ExprNode,
        relation: &Relation,
        hint: Option<DataType>,
    ) -> Result<DataType> {
        let resolved = match &mut expr.kind {
            ExprKind::Column(name) => {
                let index = resolve_column(relation, name)?;
                let ty = relation.columns[index].ty;
                expr.sem.column_index = Some(index);
                expr.sem.relation = Some(relation.name.clone());
                ty
            }
            ExprKind::Literal(literal) => literal_type(literal, hint)?,
            ExprKind::Binary { op, left, right } => {
                let op = *op;
                match op {
                    BinaryOperator::And | BinaryOperator::Or => {
                        self.analyze_expr(left, relation, None)?;
                        self.analyze_expr(right, relation, None)?;
                        DataType::U32
                    }
                    BinaryOperator::Eq
                    | BinaryOperator::NotEq
                    | BinaryOperator::Less
                    | BinaryOperator::LessEq
                    | BinaryOperator::Greater
                    | BinaryOperator::GreaterEq => {
                        let (left_ty, right_ty) = self.analyze_pair(left, right, relation)?;
                        if left_ty != right_ty {
                            return Err(Error::msg(format!(
                                "cannot compare {} with {}",
                                left_ty, right_ty
                            )));
                        }
                        DataType::U32
                    }
                    BinaryOperator::Plus
                    | BinaryOperator::Minus
                    | BinaryOperator::Multiply
                    | BinaryOperator::Divide => {
                        let (left_ty, right_ty) = self.analyze_pair(left, right, relation)?;
                        if left_ty != right_ty {
                            return Err(Error::msg(format!(
                                "arithmetic between {} and {}",
                                left_ty, right_ty
                            )));
                        }
                        if left_ty.is_char() {
                            return Err(Error::msg("arithmetic on a text column"));
                        }
                        left_ty
                    }
                }
            }
            ExprKind::Unary { op, expr: inner } => match op {
                UnaryOperator::Not => {
                    self.analyze_expr(inner, relation, None)?;
                    DataType::U32
                }
                UnaryOperator::Minus => {
                    let ty = self.analyze_expr(inner, relation, hint)?;
                    if ty.is_char() {
                        return Err(Error::msg("negation of a text value"));
                    }
                    ty
                }
            },
        };
        expr.sem.resolved_type = Some(resolved);
        Ok(resolved)
    }

    /// Analyzes both operands, letting a column on one side type a literal
    /// on the other.
    fn analyze_pair(
        &self,
        left: &mut ExprNode,
        right: &mut ExprNode,
        relation: &Relation,
    ) -> Result<(DataType, DataType)> {
        if matches!(left.kind, ExprKind::Literal(_)) && !matches!(right.kind, ExprKind::Literal(_))
        {
            let right_ty = self.analyze_expr(right, relation, None)?;
            let left_ty = self.analyze_expr(left, relation, Some(right_ty))?;
            Ok((left_ty, right_ty))
        } else {
            let left_ty = self.analyze_expr(left, relation, None)?;
            let right_ty = self.analyze_expr(right, relation, Some(left_ty))?;
            Ok((left_ty, right_ty))
        }
    }
}

fn resolve_column(relation: &Relation, name: &str) -> Result<usize> {
    relation.column_index(name).ok_or_else(|| {
        Error::msg(format!(
            "unknown column {} in table {}",
            name, relation.name
        ))
    })
}

fn literal_type(literal: &Literal, hint: Option<DataType>) -> Result<DataType> {
    match literal {
        Literal::Integer(_) => match hint {
            Some(ty) if ty.is_integer() || ty.is_float() => Ok(ty),
            Some(ty) => Err(Error::msg(format!("integer literal used as {}", ty))),
            None => Ok(DataType::U32),
        },
        Literal::Float(_) => match hint {
            Some(ty) if ty.is_float() => Ok(ty),
            Some(ty) => Err(Error::msg(format!("float literal used as {}", ty))),
            None => Ok(DataType::F64),
        },
        Literal::String(_) => match hint {
            Some(ty) if ty.is_char() => Ok(ty),
            Some(ty) => Err(Error::msg(format!("string literal used as {}", ty))),
            None => Ok(DataType::Char32),
        },
    }
}

/// Collapses `-literal` into a signed literal so INSERT and UPDATE can
/// treat negative numbers as plain literals.
fn fold_signed_literal(expr: &mut ExprNode) {
    let folded = match &expr.kind {
        ExprKind::Unary {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match &inner.kind {
            ExprKind::Literal(Literal::Integer(value)) => Some(Literal::Integer(-value)),
            ExprKind::Literal(Literal::Float(value)) => Some(Literal::Float(-value)),
            _ => None,
        },
        _ => None,
    };
    if let Some(literal) = folded {
        expr.kind = ExprKind::Literal(literal);
    }
}

#[cfg(test)]
mod tests {
    use super::Analyzer;
    use crate::catalog::{Attribute, Catalog, Relation};
    use crate::parser::ast::Statement;
    use crate::parser::parse_sql;
    use crate::storage::btree::BTree;
    use crate::storage::pager::Pager;
    use crate::types::DataType;

    use anyhow::Result;
    use tempfile::tempdir;

    fn catalog_with_users() -> Result<(Catalog, tempfile::TempDir)> {
        let dir = tempdir()?;
        let mut pager = Pager::open(dir.path().join("an.db"))?;
        let mut catalog = Catalog::open(&mut pager)?;
        pager.begin_transaction()?;
        let tree = BTree::create(&mut pager, DataType::U32, 36, true)?;
        pager.commit()?;
        catalog.insert(Relation {
            name: "users".to_owned(),
            columns: vec![
                Attribute::new("id", DataType::U32),
                Attribute::new("name", DataType::Char32),
                Attribute::new("age", DataType::U32),
            ],
            tree,
            sql: String::new(),
        });
        Ok((catalog, dir))
    }

    fn analyze_one(catalog: &Catalog, sql: &str) -> Result<Statement> {
        let mut statement = parse_sql(sql)?.remove(0);
        Analyzer::new(catalog).analyze(&mut statement)?;
        Ok(statement)
    }

    #[test]
    fn resolves_projections_and_filter_columns() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        let statement = analyze_one(&catalog, "SELECT name, id FROM users WHERE age > 30")?;
        let Statement::Select(select) = statement else {
            panic!("expected SELECT");
        };
        assert_eq!(select.sem.column_indices, vec![1, 0]);
        let filter = select.filter.unwrap();
        let crate::parser::ast::ExprKind::Binary { left, right, .. } = filter.kind else {
            panic!("expected binary filter");
        };
        assert_eq!(left.sem.column_index, Some(2));
        assert_eq!(left.sem.relation.as_deref(), Some("users"));
        // The literal picked up the column's type.
        assert_eq!(right.sem.resolved_type, Some(DataType::U32));
        Ok(())
    }

    #[test]
    fn wildcard_expands_in_table_order() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        let statement = analyze_one(&catalog, "SELECT * FROM users")?;
        let Statement::Select(select) = statement else {
            panic!("expected SELECT");
        };
        assert_eq!(select.sem.column_indices, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn order_by_builds_the_ephemeral_format() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        let statement = analyze_one(&catalog, "SELECT id FROM users ORDER BY name DESC")?;
        let Statement::Select(select) = statement else {
            panic!("expected SELECT");
        };
        assert_eq!(select.sem.order_by_index, 1);
        let format = select.sem.rb_format.unwrap();
        assert_eq!(format.columns, vec![DataType::Char32, DataType::U32]);
        Ok(())
    }

    #[test]
    fn unknown_names_are_rejected() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        assert!(analyze_one(&catalog, "SELECT id FROM missing").is_err());
        assert!(analyze_one(&catalog, "SELECT nope FROM users").is_err());
        assert!(analyze_one(&catalog, "DELETE FROM users WHERE nope = 1").is_err());
        Ok(())
    }

    #[test]
    fn type_mismatches_are_rejected() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        assert!(analyze_one(&catalog, "SELECT id FROM users WHERE name = 5").is_err());
        assert!(analyze_one(&catalog, "SELECT id FROM users WHERE id = 'x'").is_err());
        assert!(analyze_one(&catalog, "INSERT INTO users VALUES ('x', 'y', 1)").is_err());
        Ok(())
    }

    #[test]
    fn insert_requires_literals_and_matching_arity() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        assert!(analyze_one(&catalog, "INSERT INTO users VALUES (1, 'a')").is_err());
        assert!(analyze_one(&catalog, "INSERT INTO users VALUES (id, 'a', 2)").is_err());

        let statement = analyze_one(&catalog, "INSERT INTO users (id, name) VALUES (1, 'a')")?;
        let Statement::Insert(insert) = statement else {
            panic!("expected INSERT");
        };
        assert_eq!(insert.sem.column_indices, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn update_cannot_touch_the_key() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        assert!(analyze_one(&catalog, "UPDATE users SET id = 2").is_err());
        assert!(analyze_one(&catalog, "UPDATE users SET age = 31 WHERE id = 1").is_ok());
        Ok(())
    }

    #[test]
    fn master_catalog_is_read_only_through_sql() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        assert!(analyze_one(&catalog, "SELECT * FROM master_catalog").is_ok());
        assert!(analyze_one(&catalog, "DROP TABLE master_catalog").is_err());
        assert!(
            analyze_one(&catalog, "DELETE FROM master_catalog WHERE id = 0").is_err()
        );
        Ok(())
    }

    #[test]
    fn create_table_checks() -> Result<()> {
        let (catalog, _dir) = catalog_with_users()?;
        assert!(analyze_one(&catalog, "CREATE TABLE users (id INT)").is_err());
        assert!(analyze_one(&catalog, "CREATE TABLE t (a INT, a TEXT)").is_err());
        assert!(analyze_one(&catalog, "CREATE TABLE t (a INT, b TEXT PRIMARY KEY)").is_err());
        assert!(analyze_one(&catalog, "CREATE TABLE t (a INT PRIMARY KEY, b TEXT)").is_ok());
        Ok(())
    }
}
