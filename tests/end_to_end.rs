use anyhow::Result;
use tempfile::tempdir;

use silt::types::Value;
use silt::Database;

fn rows_of(db: &mut Database, sql: &str) -> Result<Vec<Vec<Value>>> {
    let mut rows = vec![];
    db.execute(sql, |row| rows.push(row.to_vec()))?;
    Ok(rows)
}

fn ints(rows: &[Vec<Value>]) -> Vec<u32> {
    rows.iter().map(|row| row[0].as_u32()).collect()
}

#[test]
fn create_insert_select_star_preserves_key_order() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
    db.execute("INSERT INTO t VALUES (1, 'a')", |_| {})?;
    db.execute("INSERT INTO t VALUES (2, 'b')", |_| {})?;

    let rows = rows_of(&mut db, "SELECT * FROM t")?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0].as_u32(), 1);
    assert_eq!(rows[0][1].as_str(), "a");
    assert_eq!(rows[1][0].as_u32(), 2);
    assert_eq!(rows[1][1].as_str(), "b");
    Ok(())
}

#[test]
fn delete_removes_exactly_the_matching_row() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
    db.execute("INSERT INTO t VALUES (1, 'a')", |_| {})?;
    db.execute("INSERT INTO t VALUES (2, 'b')", |_| {})?;
    db.execute("INSERT INTO t VALUES (3, 'c')", |_| {})?;
    db.execute("DELETE FROM t WHERE k = 2", |_| {})?;

    let rows = rows_of(&mut db, "SELECT k FROM t")?;
    assert_eq!(ints(&rows), vec![1, 3]);
    Ok(())
}

#[test]
fn pk_lookup_returns_one_row() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
    db.execute("INSERT INTO t VALUES (1, 'a')", |_| {})?;
    db.execute("INSERT INTO t VALUES (2, 'b')", |_| {})?;

    let rows = rows_of(&mut db, "SELECT v FROM t WHERE k = 1")?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].as_str(), "a");

    let rows = rows_of(&mut db, "SELECT v FROM t WHERE k = 99")?;
    assert!(rows.is_empty());
    Ok(())
}

#[test]
fn order_by_desc_sorts_on_the_named_column() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
    db.execute("INSERT INTO t VALUES (1, 'a')", |_| {})?;
    db.execute("INSERT INTO t VALUES (2, 'c')", |_| {})?;
    db.execute("INSERT INTO t VALUES (3, 'b')", |_| {})?;

    let rows = rows_of(&mut db, "SELECT k FROM t ORDER BY v DESC")?;
    assert_eq!(ints(&rows), vec![2, 3, 1]);

    let rows = rows_of(&mut db, "SELECT k FROM t ORDER BY v ASC")?;
    assert_eq!(ints(&rows), vec![1, 3, 2]);
    Ok(())
}

#[test]
fn rollback_hides_uncommitted_rows() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
    db.execute("BEGIN", |_| {})?;
    db.execute("INSERT INTO t VALUES (99, 'z')", |_| {})?;
    db.execute("ROLLBACK", |_| {})?;

    let rows = rows_of(&mut db, "SELECT * FROM t WHERE k = 99")?;
    assert!(rows.is_empty());
    Ok(())
}

#[test]
fn committed_data_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.db");
    {
        let mut db = Database::open(&path)?;
        db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
        db.execute("INSERT INTO t VALUES (1, 'a')", |_| {})?;
        db.execute("INSERT INTO t VALUES (2, 'b')", |_| {})?;
        db.execute("INSERT INTO t VALUES (3, 'c')", |_| {})?;
        db.execute("DELETE FROM t WHERE k = 2", |_| {})?;
    }

    let mut db = Database::open(&path)?;
    let rows = rows_of(&mut db, "SELECT k FROM t")?;
    assert_eq!(ints(&rows), vec![1, 3]);

    // The catalog itself is table-valued and reloads from page 1.
    let master = rows_of(&mut db, "SELECT name FROM master_catalog")?;
    assert_eq!(master.len(), 1);
    assert_eq!(master[0][0].as_str(), "t");
    Ok(())
}

#[test]
fn multi_statement_batch_runs_in_order() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute(
        "CREATE TABLE t (k INT, v TEXT); \
         INSERT INTO t VALUES (1, 'a'); \
         INSERT INTO t VALUES (2, 'b');",
        |_| {},
    )?;
    let rows = rows_of(&mut db, "SELECT k FROM t;")?;
    assert_eq!(ints(&rows), vec![1, 2]);
    Ok(())
}

#[test]
fn range_scans_and_updates_compose() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, n INT)", |_| {})?;
    for k in 1..=10u32 {
        db.execute(&format!("INSERT INTO t VALUES ({}, {})", k, k * 10), |_| {})?;
    }

    let rows = rows_of(&mut db, "SELECT k FROM t WHERE k > 7")?;
    assert_eq!(ints(&rows), vec![8, 9, 10]);

    // Backward range scan yields descending keys.
    let rows = rows_of(&mut db, "SELECT k FROM t WHERE k <= 3")?;
    assert_eq!(ints(&rows), vec![3, 2, 1]);

    db.execute("UPDATE t SET n = 0 WHERE k >= 9", |_| {})?;
    let rows = rows_of(&mut db, "SELECT n FROM t WHERE k >= 9")?;
    assert_eq!(ints(&rows), vec![0, 0]);

    db.execute("UPDATE t SET n = 1", |_| {})?;
    let rows = rows_of(&mut db, "SELECT n FROM t WHERE k = 5")?;
    assert_eq!(ints(&rows), vec![1]);
    Ok(())
}

#[test]
fn delete_without_where_empties_the_table() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
    for k in 0..200u32 {
        db.execute(&format!("INSERT INTO t VALUES ({}, 'x')", k), |_| {})?;
    }
    db.execute("DELETE FROM t", |_| {})?;
    assert!(rows_of(&mut db, "SELECT k FROM t")?.is_empty());

    // The table is still writable afterwards.
    db.execute("INSERT INTO t VALUES (7, 'y')", |_| {})?;
    assert_eq!(ints(&rows_of(&mut db, "SELECT k FROM t")?), vec![7]);
    Ok(())
}

#[test]
fn many_rows_split_nodes_and_stay_ordered() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE t (k INT, v TEXT)", |_| {})?;
    db.execute("BEGIN", |_| {})?;
    // Insert in a shuffled-ish order to force splits on both sides.
    for k in (0..500u32).step_by(2).chain((1..500).step_by(2)) {
        db.execute(&format!("INSERT INTO t VALUES ({}, 'r')", k), |_| {})?;
    }
    db.execute("COMMIT", |_| {})?;

    let rows = rows_of(&mut db, "SELECT k FROM t")?;
    let keys = ints(&rows);
    assert_eq!(keys.len(), 500);
    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

#[test]
fn two_tables_are_fully_independent() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE a (k INT, v TEXT)", |_| {})?;
    db.execute("CREATE TABLE b (k INT, n INT)", |_| {})?;
    db.execute("INSERT INTO a VALUES (1, 'one')", |_| {})?;
    db.execute("INSERT INTO b VALUES (1, 100)", |_| {})?;
    db.execute("DROP TABLE a", |_| {})?;

    let rows = rows_of(&mut db, "SELECT n FROM b WHERE k = 1")?;
    assert_eq!(ints(&rows), vec![100]);
    assert_eq!(db.tables(), vec!["b".to_owned(), "master_catalog".to_owned()]);
    Ok(())
}

#[test]
fn char_keys_compare_lexicographically() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("t.db"))?;

    db.execute("CREATE TABLE words (w TEXT, n INT)", |_| {})?;
    for word in ["pear", "apple", "quince", "banana"] {
        db.execute(&format!("INSERT INTO words VALUES ('{}', 1)", word), |_| {})?;
    }
    let rows = rows_of(&mut db, "SELECT w FROM words")?;
    let words: Vec<String> = rows
        .iter()
        .map(|row| row[0].as_str().to_owned())
        .collect();
    assert_eq!(words, vec!["apple", "banana", "pear", "quince"]);
    Ok(())
}
