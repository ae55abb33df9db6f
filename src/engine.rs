use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::analyzer::Analyzer;
use crate::catalog::{Attribute, Catalog, Relation};
use crate::compiler::compile_statement;
use crate::parser::ast::Statement;
use crate::parser::parse_sql;
use crate::storage::btree::BTree;
use crate::storage::pager::Pager;
use crate::types::{DataType, TupleFormat, Value};
use crate::vm::{self, VmError};

/// One open database: the pager for its file and the catalog loaded from
/// the master table. All SQL enters through `execute`.
pub struct Database {
    pager: Pager,
    catalog: Catalog,
}

impl Database {
    /// Opens (or creates and bootstraps) a database file. A hot journal is
    /// rolled back before the catalog is read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut pager = Pager::open(path.as_ref().to_path_buf())
            .with_context(|| format!("could not open database {}", path.as_ref().display()))?;
        let catalog = Catalog::open(&mut pager)?;
        Ok(Self { pager, catalog })
    }

    /// Runs every statement in `sql` in order, streaming result rows to
    /// `on_row`. Mutating statements outside an explicit transaction get
    /// an implicit one wrapped around them.
    pub fn execute(&mut self, sql: &str, mut on_row: impl FnMut(&[Value])) -> Result<()> {
        let statements = parse_sql(sql)?;
        for statement in statements {
            self.execute_statement(statement, &mut on_row)?;
        }
        Ok(())
    }

    fn execute_statement(
        &mut self,
        mut statement: Statement,
        on_row: &mut dyn FnMut(&[Value]),
    ) -> Result<()> {
        Analyzer::new(&self.catalog).analyze(&mut statement)?;

        // CREATE TABLE: the schema enters the catalog before the program
        // runs so the host function can build the tree from it. The
        // relation starts with no storage; the function fills the root in.
        if let Statement::CreateTable(create) = &statement {
            let columns: Vec<Attribute> = create
                .columns
                .iter()
                .map(|col| Attribute::new(col.name.clone(), col.ty))
                .collect();
            let types: Vec<DataType> = columns.iter().map(|c| c.ty).collect();
            let format = TupleFormat::from_columns(&types);
            let tree =
                BTree::create(&mut self.pager, format.key_type(), format.record_size, false)?;
            self.catalog.insert(Relation {
                name: create.table.clone(),
                columns,
                tree,
                sql: create.sql.clone(),
            });
        }

        let program = compile_statement(&statement, &mut self.catalog)?;

        let implicit = statement_mutates(&statement) && !self.pager.in_transaction();
        if implicit {
            self.pager.begin_transaction()?;
        }

        match vm::execute(&program, &mut self.pager, &mut self.catalog, on_row) {
            Ok(()) => {
                if implicit {
                    self.pager.commit()?;
                }
                Ok(())
            }
            Err(err) => {
                if self.pager.in_transaction() {
                    if let Err(rollback_err) = self.pager.rollback() {
                        warn!(error = %rollback_err, "rollback after failed program also failed");
                    }
                }
                // An abort means the catalog may be ahead of the (now
                // rolled back) disk state; a failed CREATE leaves the
                // pre-registered schema behind. Reloading fixes both.
                let aborted = matches!(err.downcast_ref::<VmError>(), Some(VmError::Abort(_)));
                if aborted || matches!(statement, Statement::CreateTable(_)) {
                    self.catalog.reload(&mut self.pager)?;
                }
                Err(err)
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.pager.in_transaction()
    }

    pub fn tables(&self) -> Vec<String> {
        self.catalog.list_tables()
    }

    pub fn columns_of(&self, table: &str) -> Option<Vec<(String, DataType)>> {
        self.catalog.get(table).map(|rel| {
            rel.columns
                .iter()
                .map(|col| (col.name.clone(), col.ty))
                .collect()
        })
    }
}

fn statement_mutates(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::Insert(_)
            | Statement::Update(_)
            | Statement::Delete(_)
            | Statement::CreateTable(_)
            | Statement::DropTable(_)
    )
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::types::Value;

    use anyhow::Result;
    use tempfile::tempdir;

    fn rows_of(db: &mut Database, sql: &str) -> Result<Vec<Vec<Value>>> {
        let mut rows = vec![];
        db.execute(sql, |row| rows.push(row.to_vec()))?;
        Ok(rows)
    }

    #[test]
    fn create_insert_select_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let mut db = Database::open(dir.path().join("e.db"))?;
        db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
        db.execute("INSERT INTO t VALUES (1, 'a')", |_| {})?;

        let rows = rows_of(&mut db, "SELECT * FROM t")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_u32(), 1);
        assert_eq!(rows[0][1].as_str(), "a");
        Ok(())
    }

    #[test]
    fn failed_create_leaves_no_schema_behind() -> Result<()> {
        let dir = tempdir()?;
        let mut db = Database::open(dir.path().join("e.db"))?;
        db.execute("CREATE TABLE t (k INT)", |_| {})?;
        assert!(db.execute("CREATE TABLE t (k INT)", |_| {}).is_err());

        // The survivor is the original table, still usable.
        db.execute("INSERT INTO t VALUES (5)", |_| {})?;
        let rows = rows_of(&mut db, "SELECT k FROM t")?;
        assert_eq!(rows.len(), 1);
        Ok(())
    }

    #[test]
    fn failed_insert_in_implicit_transaction_rolls_back() -> Result<()> {
        let dir = tempdir()?;
        let mut db = Database::open(dir.path().join("e.db"))?;
        db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
        db.execute("INSERT INTO t VALUES (1, 'a')", |_| {})?;

        // Duplicate key: statement fails, nothing is half-committed.
        assert!(db.execute("INSERT INTO t VALUES (1, 'b')", |_| {}).is_err());
        assert!(!db.in_transaction());
        let rows = rows_of(&mut db, "SELECT v FROM t")?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_str(), "a");
        Ok(())
    }

    #[test]
    fn explicit_transaction_survives_statement_boundaries() -> Result<()> {
        let dir = tempdir()?;
        let mut db = Database::open(dir.path().join("e.db"))?;
        db.execute("CREATE TABLE t (k INT)", |_| {})?;

        db.execute("BEGIN", |_| {})?;
        assert!(db.in_transaction());
        db.execute("INSERT INTO t VALUES (1)", |_| {})?;
        db.execute("INSERT INTO t VALUES (2)", |_| {})?;
        db.execute("COMMIT", |_| {})?;
        assert!(!db.in_transaction());

        assert_eq!(rows_of(&mut db, "SELECT k FROM t")?.len(), 2);
        Ok(())
    }

    #[test]
    fn drop_table_removes_rows_and_schema() -> Result<()> {
        let dir = tempdir()?;
        let mut db = Database::open(dir.path().join("e.db"))?;
        db.execute("CREATE TABLE gone (k INT)", |_| {})?;
        db.execute("INSERT INTO gone VALUES (1)", |_| {})?;
        db.execute("DROP TABLE gone", |_| {})?;

        assert!(!db.tables().contains(&"gone".to_owned()));
        assert!(rows_of(&mut db, "SELECT k FROM gone").is_err());

        // The name is free for reuse.
        db.execute("CREATE TABLE gone (k INT, v TEXT)", |_| {})?;
        assert_eq!(rows_of(&mut db, "SELECT * FROM gone")?.len(), 0);
        Ok(())
    }
}
