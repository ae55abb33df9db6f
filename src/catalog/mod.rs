use std::collections::HashMap;

use anyhow::{Context, Error, Result};
use lazy_static::lazy_static;
use tracing::debug;

use crate::common::{MASTER_CATALOG_NAME, MASTER_ROOT_PAGE_NO};
use crate::parser::ast::Statement;
use crate::parser::parse_sql;
use crate::storage::btree::{BTree, BTreeCursor};
use crate::storage::pager::Pager;
use crate::types::{DataType, TupleFormat, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub ty: DataType,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: DataType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A named table: typed columns (the first is the primary key) plus the
/// B+Tree holding its rows.
#[derive(Clone, Debug)]
pub struct Relation {
    pub name: String,
    pub columns: Vec<Attribute>,
    pub tree: BTree,
    /// The CREATE TABLE text this relation was defined with; empty for the
    /// bootstrapped master relation.
    pub sql: String,
}

impl Relation {
    pub fn format(&self) -> TupleFormat {
        let types: Vec<DataType> = self.columns.iter().map(|col| col.ty).collect();
        TupleFormat::from_columns(&types)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }
}

lazy_static! {
    static ref MASTER_COLUMNS: Vec<Attribute> = vec![
        Attribute::new("id", DataType::U32),
        Attribute::new("name", DataType::Char32),
        Attribute::new("tbl_name", DataType::Char32),
        Attribute::new("rootpage", DataType::U32),
        Attribute::new("sql", DataType::Char256),
    ];
}

/// The schema cache: every known relation by name, kept in sync with the
/// master catalog table rooted at page 1.
pub struct Catalog {
    relations: HashMap<String, Relation>,
    next_master_id: u32,
}

impl Catalog {
    /// Bootstraps the master relation (creating its tree on a fresh file)
    /// and loads every table recorded in it.
    pub fn open(pager: &mut Pager) -> Result<Self> {
        let is_new = pager.page_count() <= 1;
        let mut catalog = Self {
            relations: HashMap::new(),
            next_master_id: 0,
        };
        catalog.bootstrap_master(pager, is_new)?;
        catalog.load_from_master(pager)?;
        debug!(tables = catalog.relations.len(), "catalog loaded");
        Ok(catalog)
    }

    /// Drops the in-memory cache and rebuilds it from disk. Used after an
    /// aborted program may have left the cache out of sync.
    pub fn reload(&mut self, pager: &mut Pager) -> Result<()> {
        self.relations.clear();
        self.next_master_id = 0;
        self.bootstrap_master(pager, false)?;
        self.load_from_master(pager)
    }

    fn bootstrap_master(&mut self, pager: &mut Pager, is_new: bool) -> Result<()> {
        let format = TupleFormat::from_columns(
            &MASTER_COLUMNS.iter().map(|c| c.ty).collect::<Vec<_>>(),
        );
        let tree = if is_new {
            pager.begin_transaction()?;
            let tree = BTree::create(pager, format.key_type(), format.record_size, true)
                .with_context(|| "could not create the master catalog tree")?;
            if tree.root_page != MASTER_ROOT_PAGE_NO {
                return Err(Error::msg(format!(
                    "master catalog root landed on page {} instead of {}",
                    tree.root_page, MASTER_ROOT_PAGE_NO
                )));
            }
            pager.commit()?;
            tree
        } else {
            let mut tree = BTree::create(pager, format.key_type(), format.record_size, false)?;
            tree.root_page = MASTER_ROOT_PAGE_NO;
            tree
        };

        self.relations.insert(
            MASTER_CATALOG_NAME.to_owned(),
            Relation {
                name: MASTER_CATALOG_NAME.to_owned(),
                columns: MASTER_COLUMNS.clone(),
                tree,
                sql: String::new(),
            },
        );
        Ok(())
    }

    /// Scans the master table and rebuilds one relation per row by
    /// re-parsing its recorded CREATE TABLE text.
    fn load_from_master(&mut self, pager: &mut Pager) -> Result<()> {
        let master = self
            .relations
            .get(MASTER_CATALOG_NAME)
            .expect("master relation is always present");
        let format = master.format();
        let mut cursor = BTreeCursor::new(master.tree);

        let mut more = cursor.first(pager)?;
        while more {
            let key = cursor.key_bytes(pager)?;
            let record = cursor.record_bytes(pager)?;
            let id = u32::from_le_bytes(key[..4].try_into().unwrap());

            let name = record_str(&format, &record, 1);
            let rootpage = record_u32(&format, &record, 3);
            let sql = record_str(&format, &record, 4);

            if self.next_master_id <= id {
                self.next_master_id = id + 1;
            }

            let statements = parse_sql(&sql)
                .with_context(|| format!("invalid CREATE statement recorded for {}", name))?;
            let columns = match statements.into_iter().next() {
                Some(Statement::CreateTable(create)) => create
                    .columns
                    .into_iter()
                    .map(|col| Attribute::new(col.name, col.ty))
                    .collect::<Vec<_>>(),
                _ => {
                    return Err(Error::msg(format!(
                        "master catalog row for {} does not hold a CREATE TABLE statement",
                        name
                    )))
                }
            };

            let types: Vec<DataType> = columns.iter().map(|c| c.ty).collect();
            let rel_format = TupleFormat::from_columns(&types);
            let mut tree =
                BTree::create(pager, rel_format.key_type(), rel_format.record_size, false)?;
            tree.root_page = rootpage;

            self.relations.insert(
                name.clone(),
                Relation {
                    name,
                    columns,
                    tree,
                    sql,
                },
            );

            more = cursor.next(pager)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Relation> {
        self.relations.get_mut(name)
    }

    pub fn require(&self, name: &str) -> Result<&Relation> {
        self.get(name)
            .ok_or_else(|| Error::msg(format!("unknown table {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    /// Registers a relation in the cache only; the master catalog row is
    /// the compiled CREATE TABLE program's job.
    pub fn insert(&mut self, relation: Relation) {
        self.relations.insert(relation.name.clone(), relation);
    }

    pub fn remove(&mut self, name: &str) -> Option<Relation> {
        self.relations.remove(name)
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.relations.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Hands out the next master catalog row id.
    pub fn allocate_master_id(&mut self) -> u32 {
        let id = self.next_master_id;
        self.next_master_id += 1;
        id
    }
}

fn record_str(format: &TupleFormat, record: &[u8], column: usize) -> String {
    let (offset, size) = format.record_range(column);
    Value::from_bytes(format.columns[column], &record[offset..offset + size])
        .as_str()
        .to_owned()
}

fn record_u32(format: &TupleFormat, record: &[u8], column: usize) -> u32 {
    let (offset, size) = format.record_range(column);
    Value::from_bytes(format.columns[column], &record[offset..offset + size]).as_u32()
}

#[cfg(test)]
mod tests {
    use super::Catalog;
    use crate::common::MASTER_ROOT_PAGE_NO;
    use crate::storage::pager::Pager;
    use crate::types::DataType;

    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_places_master_root_at_page_one() -> Result<()> {
        let dir = tempdir()?;
        let mut pager = Pager::open(dir.path().join("cat.db"))?;
        let catalog = Catalog::open(&mut pager)?;

        let master = catalog.get("master_catalog").unwrap();
        assert_eq!(master.tree.root_page, MASTER_ROOT_PAGE_NO);
        assert_eq!(master.columns.len(), 5);
        assert_eq!(master.columns[0].ty, DataType::U32);
        Ok(())
    }

    #[test]
    fn reopen_finds_the_master_without_bootstrap() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cat.db");
        {
            let mut pager = Pager::open(&path)?;
            Catalog::open(&mut pager)?;
        }
        let mut pager = Pager::open(&path)?;
        let catalog = Catalog::open(&mut pager)?;
        assert!(catalog.contains("master_catalog"));
        assert_eq!(catalog.list_tables(), vec!["master_catalog".to_owned()]);
        Ok(())
    }

    #[test]
    fn master_record_layout_matches_column_widths() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("cat.db")).unwrap();
        let catalog = Catalog::open(&mut pager).unwrap();
        let format = catalog.get("master_catalog").unwrap().format();
        // name, tbl_name, rootpage, sql concatenate into the record.
        assert_eq!(format.record_size, 32 + 32 + 4 + 256);
        assert_eq!(format.record_range(1), (0, 32));
        assert_eq!(format.record_range(3), (64, 4));
        assert_eq!(format.record_range(4), (68, 256));
    }
}
