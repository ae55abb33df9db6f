use anyhow::{Error, Result};

use crate::catalog::{Catalog, Relation};
use crate::common::{ArithOp, CompareOp, LogicOp, MASTER_CATALOG_NAME};
use crate::parser::ast::{
    BinaryOperator, CreateTableStatement, DeleteStatement, DropTableStatement, ExprKind, ExprNode,
    InsertStatement, Literal, SelectStatement, Statement, UnaryOperator, UpdateStatement,
};
use crate::types::{DataType, Value};
use crate::vm::{CursorContext, CursorTarget, Instruction, VmFunction};

mod builder;

pub use builder::{IfContext, ProgramBuilder, RegisterAllocator, WhileContext};

/// Lowers one analyzed statement to a bytecode program.
pub fn compile_statement(statement: &Statement, catalog: &mut Catalog) -> Result<Vec<Instruction>> {
    match statement {
        Statement::Select(select) => compile_select(select, catalog),
        Statement::Insert(insert) => compile_insert(insert, catalog),
        Statement::Update(update) => compile_update(update, catalog),
        Statement::Delete(delete) => compile_delete(delete, catalog),
        Statement::CreateTable(create) => compile_create_table(create, catalog),
        Statement::DropTable(drop) => compile_drop_table(drop, catalog),
        Statement::Begin => compile_transaction_op(Instruction::Begin),
        Statement::Commit => compile_transaction_op(Instruction::Commit),
        Statement::Rollback => compile_transaction_op(Instruction::Rollback),
    }
}

fn btree_cursor_context(relation: &Relation) -> CursorContext {
    CursorContext {
        target: CursorTarget::BTree(relation.tree),
        format: relation.format(),
    }
}

// ---------------------------------------------------------------------
// Primary-key seek analysis
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanKind {
    /// Walk the whole table from the first row.
    FullScan,
    /// Seek to the boundary row, then scan in one direction.
    SeekScan,
    /// Single-row lookup; primary keys are unique, so no loop at all.
    DirectLookup,
}

#[derive(Debug)]
struct SeekStrategy {
    kind: ScanKind,
    op: CompareOp,
    key: Option<ExprNode>,
    scan_forward: bool,
}

impl SeekStrategy {
    fn full_scan() -> Self {
        Self {
            kind: ScanKind::FullScan,
            op: CompareOp::Eq,
            key: None,
            scan_forward: true,
        }
    }
}

/// A predicate of the shape `pk <op> literal`, where the column reference
/// resolved to column 0 of the scanned relation itself.
fn match_pk_predicate(expr: &ExprNode, relation: &Relation) -> Option<SeekStrategy> {
    let ExprKind::Binary { op, left, right } = &expr.kind else {
        return None;
    };
    if !matches!(left.kind, ExprKind::Column(_)) || !matches!(right.kind, ExprKind::Literal(_)) {
        return None;
    }
    if left.sem.column_index != Some(0) || left.sem.relation.as_deref() != Some(&relation.name[..])
    {
        return None;
    }
    let (seek_op, kind, scan_forward) = match op {
        BinaryOperator::Eq => (CompareOp::Eq, ScanKind::DirectLookup, true),
        BinaryOperator::Less => (CompareOp::Less, ScanKind::SeekScan, false),
        BinaryOperator::LessEq => (CompareOp::LessEq, ScanKind::SeekScan, false),
        BinaryOperator::Greater => (CompareOp::Greater, ScanKind::SeekScan, true),
        BinaryOperator::GreaterEq => (CompareOp::GreaterEq, ScanKind::SeekScan, true),
        _ => return None,
    };
    Some(SeekStrategy {
        kind,
        op: seek_op,
        key: Some((**right).clone()),
        scan_forward,
    })
}

/// Pulls a primary-key predicate out of the filter. The matched predicate
/// is removed from the tree (the seek subsumes it); any AND-combined
/// remainder stays behind for row-level evaluation.
fn take_seek_strategy(filter: &mut Option<ExprNode>, relation: &Relation) -> SeekStrategy {
    let Some(expr) = filter.take() else {
        return SeekStrategy::full_scan();
    };
    let (strategy, remainder) = extract_pk(expr, relation);
    *filter = remainder;
    strategy.unwrap_or_else(SeekStrategy::full_scan)
}

fn extract_pk(expr: ExprNode, relation: &Relation) -> (Option<SeekStrategy>, Option<ExprNode>) {
    if let Some(strategy) = match_pk_predicate(&expr, relation) {
        return (Some(strategy), None);
    }
    match expr.kind {
        ExprKind::Binary {
            op: BinaryOperator::And,
            left,
            right,
        } => {
            let (strategy, left_rest) = extract_pk(*left, relation);
            if strategy.is_some() {
                let remainder = match left_rest {
                    Some(rest) => Some(and_expr(rest, *right)),
                    None => Some(*right),
                };
                return (strategy, remainder);
            }
            let left = left_rest.expect("no strategy extracted, subtree is intact");
            let (strategy, right_rest) = extract_pk(*right, relation);
            if strategy.is_some() {
                let remainder = match right_rest {
                    Some(rest) => Some(and_expr(left, rest)),
                    None => Some(left),
                };
                return (strategy, remainder);
            }
            let right = right_rest.expect("no strategy extracted, subtree is intact");
            (None, Some(and_expr(left, right)))
        }
        kind => (None, Some(ExprNode { kind, sem: expr.sem })),
    }
}

fn and_expr(left: ExprNode, right: ExprNode) -> ExprNode {
    ExprNode::new(ExprKind::Binary {
        op: BinaryOperator::And,
        left: Box::new(left),
        right: Box::new(right),
    })
}

// ---------------------------------------------------------------------
// Expression lowering
// ---------------------------------------------------------------------

fn literal_value(expr: &ExprNode) -> Result<Value> {
    let ExprKind::Literal(literal) = &expr.kind else {
        return Err(Error::msg("expected a literal expression"));
    };
    let ty = expr.sem.resolved_type.unwrap_or(match literal {
        Literal::Integer(_) => DataType::U32,
        Literal::Float(_) => DataType::F64,
        Literal::String(_) => DataType::Char32,
    });
    match literal {
        Literal::Integer(value) => {
            if ty.is_float() {
                Value::from_float(ty, *value as f64)
            } else {
                Value::from_int(ty, *value)
            }
        }
        Literal::Float(value) => Value::from_float(ty, *value),
        Literal::String(text) => Value::from_str(ty, text),
    }
}

fn compile_expr(prog: &mut ProgramBuilder, expr: &ExprNode, cursor: usize) -> Result<usize> {
    match &expr.kind {
        ExprKind::Column(name) => {
            let index = expr
                .sem
                .column_index
                .ok_or_else(|| Error::msg(format!("column {} was not resolved", name)))?;
            prog.get_column(cursor, index, None)
        }
        ExprKind::Literal(_) => prog.load(literal_value(expr)?, None),
        ExprKind::Binary { op, left, right } => {
            let left_reg = compile_expr(prog, left, cursor)?;
            let right_reg = compile_expr(prog, right, cursor)?;
            match op {
                BinaryOperator::Eq => prog.test(left_reg, right_reg, CompareOp::Eq, None),
                BinaryOperator::NotEq => prog.test(left_reg, right_reg, CompareOp::NotEq, None),
                BinaryOperator::Less => prog.test(left_reg, right_reg, CompareOp::Less, None),
                BinaryOperator::LessEq => prog.test(left_reg, right_reg, CompareOp::LessEq, None),
                BinaryOperator::Greater => {
                    prog.test(left_reg, right_reg, CompareOp::Greater, None)
                }
                BinaryOperator::GreaterEq => {
                    prog.test(left_reg, right_reg, CompareOp::GreaterEq, None)
                }
                BinaryOperator::And => prog.logic(left_reg, right_reg, LogicOp::And, None),
                BinaryOperator::Or => prog.logic(left_reg, right_reg, LogicOp::Or, None),
                BinaryOperator::Plus => prog.arith(left_reg, right_reg, ArithOp::Add, None),
                BinaryOperator::Minus => prog.arith(left_reg, right_reg, ArithOp::Sub, None),
                BinaryOperator::Multiply => prog.arith(left_reg, right_reg, ArithOp::Mul, None),
                BinaryOperator::Divide => prog.arith(left_reg, right_reg, ArithOp::Div, None),
            }
        }
        ExprKind::Unary { op, expr: inner } => match op {
            UnaryOperator::Not => {
                let operand = compile_expr(prog, inner, cursor)?;
                let one = prog.load(Value::from_u32(1), None)?;
                prog.arith(one, operand, ArithOp::Sub, None)
            }
            UnaryOperator::Minus => {
                let operand = compile_expr(prog, inner, cursor)?;
                let ty = inner.sem.resolved_type.unwrap_or(DataType::U32);
                let zero = prog.load(Value::zero(ty), None)?;
                prog.arith(zero, operand, ArithOp::Sub, None)
            }
        },
    }
}

// ---------------------------------------------------------------------
// Statement lowering
// ---------------------------------------------------------------------

fn compile_select(select: &SelectStatement, catalog: &Catalog) -> Result<Vec<Instruction>> {
    let mut prog = ProgramBuilder::new();
    let relation = catalog.require(&select.table)?;
    let table_cursor = prog.open_cursor(btree_cursor_context(relation));

    let mut filter = select.filter.clone();
    let strategy = take_seek_strategy(&mut filter, relation);

    // A unique-key lookup needs no loop: seek, test the leftover
    // predicate, emit the row, done.
    if strategy.kind == ScanKind::DirectLookup {
        let key_reg = prog.load(literal_value(strategy.key.as_ref().unwrap())?, None)?;
        let found = prog.seek(table_cursor, key_reg, CompareOp::Eq, None)?;

        let found_block = prog.begin_if(found);
        {
            let rest_block = match &filter {
                Some(rest) => {
                    let rest_reg = compile_expr(&mut prog, rest, table_cursor)?;
                    Some(prog.begin_if(rest_reg))
                }
                None => None,
            };
            let count = select.sem.column_indices.len();
            let start = prog.regs.allocate_range(count)?;
            for (i, &col) in select.sem.column_indices.iter().enumerate() {
                prog.get_column(table_cursor, col, Some(start + i))?;
            }
            prog.result(start, count);
            if let Some(block) = rest_block {
                prog.end_if(block);
            }
        }
        prog.end_if(found_block);

        prog.close_cursor(table_cursor);
        prog.halt(0);
        return prog.finish();
    }

    let has_order_by = select.sem.rb_format.is_some();
    let order_desc = select.order_by.as_ref().map(|o| o.desc).unwrap_or(false);
    let mut result_count = select.sem.column_indices.len();
    if has_order_by {
        result_count += 1;
    }

    let rb_cursor = match &select.sem.rb_format {
        Some(format) => Some(prog.open_cursor(CursorContext {
            target: CursorTarget::Ephemeral {
                allow_duplicates: true,
            },
            format: format.clone(),
        })),
        None => None,
    };

    let at_end = match strategy.kind {
        ScanKind::SeekScan => {
            let key_reg = prog.load(literal_value(strategy.key.as_ref().unwrap())?, None)?;
            prog.seek(table_cursor, key_reg, strategy.op, None)?
        }
        _ => prog.first(table_cursor, None)?,
    };

    let scan_loop = prog.begin_while(at_end);
    {
        prog.regs.push_scope();

        let where_block = match &filter {
            Some(predicate) => {
                let result = compile_expr(&mut prog, predicate, table_cursor)?;
                Some(prog.begin_if(result))
            }
            None => None,
        };

        let result_start = prog.regs.allocate_range(result_count)?;
        if has_order_by {
            prog.get_column(table_cursor, select.sem.order_by_index, Some(result_start))?;
        }
        let offset = has_order_by as usize;
        for (i, &col) in select.sem.column_indices.iter().enumerate() {
            prog.get_column(table_cursor, col, Some(result_start + offset + i))?;
        }

        match rb_cursor {
            Some(rb) => prog.insert_record(rb, result_start, result_count),
            None => prog.result(result_start, result_count),
        }

        if let Some(block) = where_block {
            prog.end_if(block);
        }

        if strategy.kind == ScanKind::SeekScan && !strategy.scan_forward {
            prog.prev(table_cursor, Some(at_end))?;
        } else {
            prog.next(table_cursor, Some(at_end))?;
        }

        prog.regs.pop_scope()?;
    }
    prog.end_while(scan_loop);

    prog.close_cursor(table_cursor);

    if let Some(rb) = rb_cursor {
        let rb_at_end = if order_desc {
            prog.last(rb, None)?
        } else {
            prog.first(rb, None)?
        };

        let output_loop = prog.begin_while(rb_at_end);
        {
            prog.regs.push_scope();
            let output_count = select.sem.column_indices.len();
            let output_start = prog.get_columns(rb, 1, output_count, None)?;
            prog.result(output_start, output_count);
            if order_desc {
                prog.prev(rb, Some(rb_at_end))?;
            } else {
                prog.next(rb, Some(rb_at_end))?;
            }
            prog.regs.pop_scope()?;
        }
        prog.end_while(output_loop);

        prog.close_cursor(rb);
    }

    prog.halt(0);
    prog.finish()
}

fn compile_insert(insert: &InsertStatement, catalog: &Catalog) -> Result<Vec<Instruction>> {
    let mut prog = ProgramBuilder::new();
    let relation = catalog.require(&insert.table)?;
    let cursor = prog.open_cursor(btree_cursor_context(relation));

    let row_size = relation.columns.len();
    let row_start = prog.regs.allocate_range(row_size)?;

    // Columns without a supplied value hold their type's zero.
    for (i, column) in relation.columns.iter().enumerate() {
        if !insert.sem.column_indices.contains(&i) {
            prog.load(Value::zero(column.ty), Some(row_start + i))?;
        }
    }
    for (value, &col) in insert.values.iter().zip(&insert.sem.column_indices) {
        prog.load(literal_value(value)?, Some(row_start + col))?;
    }

    prog.insert_record(cursor, row_start, row_size);
    prog.close_cursor(cursor);
    prog.halt(0);
    prog.finish()
}

fn compile_update(update: &UpdateStatement, catalog: &Catalog) -> Result<Vec<Instruction>> {
    let mut prog = ProgramBuilder::new();
    let relation = catalog.require(&update.table)?;
    let cursor = prog.open_cursor(btree_cursor_context(relation));
    let row_size = relation.columns.len();

    let mut filter = update.filter.clone();
    let strategy = take_seek_strategy(&mut filter, relation);

    if strategy.kind == ScanKind::DirectLookup {
        let key_reg = prog.load(literal_value(strategy.key.as_ref().unwrap())?, None)?;
        let found = prog.seek(cursor, key_reg, CompareOp::Eq, None)?;

        let found_block = prog.begin_if(found);
        {
            let rest_block = match &filter {
                Some(rest) => {
                    let rest_reg = compile_expr(&mut prog, rest, cursor)?;
                    Some(prog.begin_if(rest_reg))
                }
                None => None,
            };
            let row_start = prog.get_columns(cursor, 0, row_size, None)?;
            compile_assignments(&mut prog, update, row_start)?;
            prog.update_record(cursor, row_start);
            if let Some(block) = rest_block {
                prog.end_if(block);
            }
        }
        prog.end_if(found_block);

        prog.close_cursor(cursor);
        prog.halt(0);
        return prog.finish();
    }

    let at_end = match strategy.kind {
        ScanKind::SeekScan => {
            let key_reg = prog.load(literal_value(strategy.key.as_ref().unwrap())?, None)?;
            prog.seek(cursor, key_reg, strategy.op, None)?
        }
        _ => prog.first(cursor, None)?,
    };

    let scan_loop = prog.begin_while(at_end);
    {
        prog.regs.push_scope();

        let where_block = match &filter {
            Some(predicate) => {
                let result = compile_expr(&mut prog, predicate, cursor)?;
                Some(prog.begin_if(result))
            }
            None => None,
        };

        let row_start = prog.get_columns(cursor, 0, row_size, None)?;
        compile_assignments(&mut prog, update, row_start)?;
        prog.update_record(cursor, row_start);

        if let Some(block) = where_block {
            prog.end_if(block);
        }

        if strategy.kind == ScanKind::SeekScan && !strategy.scan_forward {
            prog.prev(cursor, Some(at_end))?;
        } else {
            prog.next(cursor, Some(at_end))?;
        }
        prog.regs.pop_scope()?;
    }
    prog.end_while(scan_loop);

    prog.close_cursor(cursor);
    prog.halt(0);
    prog.finish()
}

fn compile_assignments(
    prog: &mut ProgramBuilder,
    update: &UpdateStatement,
    row_start: usize,
) -> Result<()> {
    for (assignment, &col) in update.assignments.iter().zip(&update.sem.column_indices) {
        prog.load(literal_value(&assignment.value)?, Some(row_start + col))?;
    }
    Ok(())
}

fn compile_delete(delete: &DeleteStatement, catalog: &Catalog) -> Result<Vec<Instruction>> {
    let mut prog = ProgramBuilder::new();
    let relation = catalog.require(&delete.table)?;
    let cursor = prog.open_cursor(btree_cursor_context(relation));

    let at_end = prog.first(cursor, None)?;

    let scan_loop = prog.begin_while(at_end);
    {
        prog.regs.push_scope();

        let should_delete = match &delete.filter {
            Some(predicate) => compile_expr(&mut prog, predicate, cursor)?,
            None => prog.load(Value::from_u32(1), None)?,
        };

        let mut delete_block = prog.begin_if(should_delete);
        {
            let occurred = prog.regs.allocate()?;
            let still_valid = prog.regs.allocate()?;
            prog.delete_record(cursor, occurred, still_valid);

            // A valid cursor already points at the successor; otherwise
            // restart from the first row (the loop exits when the table
            // is empty).
            let mut valid_block = prog.begin_if(still_valid);
            prog.move_into(still_valid, at_end);
            prog.begin_else(&mut valid_block);
            prog.first(cursor, Some(at_end))?;
            prog.end_if(valid_block);
        }
        prog.begin_else(&mut delete_block);
        prog.next(cursor, Some(at_end))?;
        prog.end_if(delete_block);

        prog.regs.pop_scope()?;
    }
    prog.end_while(scan_loop);

    prog.close_cursor(cursor);
    prog.halt(0);
    prog.finish()
}

fn compile_create_table(
    create: &CreateTableStatement,
    catalog: &mut Catalog,
) -> Result<Vec<Instruction>> {
    let mut prog = ProgramBuilder::new();

    let name_reg = prog.load(Value::from_str(DataType::Char32, &create.table)?, None)?;
    let root_reg = prog.call_function(VmFunction::CreateRelation, name_reg, 1, None)?;

    let master_context = btree_cursor_context(catalog.require(MASTER_CATALOG_NAME)?);
    let master_cursor = prog.open_cursor(master_context);

    let id = catalog.allocate_master_id();
    let row_start = prog.regs.allocate_range(5)?;
    prog.load(Value::from_u32(id), Some(row_start))?;
    prog.load(
        Value::from_str(DataType::Char32, &create.table)?,
        Some(row_start + 1),
    )?;
    prog.load(
        Value::from_str(DataType::Char32, &create.table)?,
        Some(row_start + 2),
    )?;
    prog.move_into(root_reg, row_start + 3);
    prog.load(
        Value::from_str(DataType::Char256, &create.sql)?,
        Some(row_start + 4),
    )?;

    prog.insert_record(master_cursor, row_start, 5);
    prog.close_cursor(master_cursor);
    prog.halt(0);
    prog.finish()
}

fn compile_drop_table(drop: &DropTableStatement, catalog: &Catalog) -> Result<Vec<Instruction>> {
    let mut prog = ProgramBuilder::new();

    let name_reg = prog.load(Value::from_str(DataType::Char32, &drop.table)?, None)?;
    prog.call_function(VmFunction::DropRelation, name_reg, 1, None)?;

    let master_context = btree_cursor_context(catalog.require(MASTER_CATALOG_NAME)?);
    let cursor = prog.open_cursor(master_context);

    let done = prog.new_label();
    let at_end = prog.first(cursor, None)?;

    let scan_loop = prog.begin_while(at_end);
    {
        prog.regs.push_scope();

        let entry_name = prog.get_column(cursor, 1, None)?;
        let matches = prog.test(entry_name, name_reg, CompareOp::Eq, None)?;

        let delete_block = prog.begin_if(matches);
        {
            let occurred = prog.regs.allocate()?;
            let still_valid = prog.regs.allocate()?;
            prog.delete_record(cursor, occurred, still_valid);
            prog.jump_to(done);
        }
        prog.end_if(delete_block);

        prog.next(cursor, Some(at_end))?;
        prog.regs.pop_scope()?;
    }
    prog.end_while(scan_loop);

    prog.define_label(done);
    prog.close_cursor(cursor);
    prog.halt(0);
    prog.finish()
}

fn compile_transaction_op(op: Instruction) -> Result<Vec<Instruction>> {
    let mut prog = ProgramBuilder::new();
    prog.emit(op);
    prog.halt(0);
    prog.finish()
}

#[cfg(test)]
mod tests {
    use super::compile_statement;
    use crate::analyzer::Analyzer;
    use crate::catalog::{Attribute, Catalog, Relation};
    use crate::common::CompareOp;
    use crate::parser::parse_sql;
    use crate::storage::btree::BTree;
    use crate::storage::pager::Pager;
    use crate::types::DataType;
    use crate::vm::{CursorTarget, Instruction};

    use anyhow::Result;
    use tempfile::tempdir;

    fn setup() -> Result<(Pager, Catalog, tempfile::TempDir)> {
        let dir = tempdir()?;
        let mut pager = Pager::open(dir.path().join("c.db"))?;
        let mut catalog = Catalog::open(&mut pager)?;
        pager.begin_transaction()?;
        let tree = BTree::create(&mut pager, DataType::U32, 36, true)?;
        pager.commit()?;
        catalog.insert(Relation {
            name: "t".to_owned(),
            columns: vec![
                Attribute::new("k", DataType::U32),
                Attribute::new("v", DataType::Char32),
                Attribute::new("n", DataType::U32),
            ],
            tree,
            sql: String::new(),
        });
        Ok((pager, catalog, dir))
    }

    fn compile(catalog: &mut Catalog, sql: &str) -> Result<Vec<Instruction>> {
        let mut statement = parse_sql(sql)?.remove(0);
        Analyzer::new(catalog).analyze(&mut statement)?;
        compile_statement(&statement, catalog)
    }

    fn count_matching(program: &[Instruction], pred: impl Fn(&Instruction) -> bool) -> usize {
        program.iter().filter(|inst| pred(inst)).count()
    }

    #[test]
    fn pk_equality_compiles_to_a_seek_without_a_scan_loop() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "SELECT v FROM t WHERE k = 1")?;

        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Seek {
                    op: CompareOp::Eq,
                    ..
                }
            )),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(i, Instruction::Step { .. })),
            0
        );
        assert_eq!(
            count_matching(&program, |i| matches!(i, Instruction::Rewind { .. })),
            0
        );
        Ok(())
    }

    #[test]
    fn pk_range_compiles_to_seek_plus_directional_scan() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;

        let program = compile(&mut catalog, "SELECT k FROM t WHERE k >= 5")?;
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Seek {
                    op: CompareOp::GreaterEq,
                    ..
                }
            )),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Step { forward: true, .. }
            )),
            1
        );

        let program = compile(&mut catalog, "SELECT k FROM t WHERE k < 5")?;
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Seek {
                    op: CompareOp::Less,
                    ..
                }
            )),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Step { forward: false, .. }
            )),
            1
        );
        Ok(())
    }

    #[test]
    fn and_combined_pk_predicate_keeps_the_remainder() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "SELECT v FROM t WHERE k = 1 AND n > 2")?;

        // The PK side became the seek; the remainder is still tested.
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Seek {
                    op: CompareOp::Eq,
                    ..
                }
            )),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Test {
                    op: CompareOp::Greater,
                    ..
                }
            )),
            1
        );
        Ok(())
    }

    #[test]
    fn plain_select_is_a_full_scan() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "SELECT k FROM t WHERE n > 2")?;
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Rewind { to_end: false, .. }
            )),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(i, Instruction::Seek { .. })),
            0
        );
        Ok(())
    }

    #[test]
    fn order_by_opens_an_ephemeral_cursor_and_two_loops() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "SELECT k FROM t ORDER BY v DESC")?;

        let ephemeral_opens = count_matching(&program, |i| {
            matches!(
                i,
                Instruction::Open {
                    context: crate::vm::CursorContext {
                        target: CursorTarget::Ephemeral { .. },
                        ..
                    },
                    ..
                }
            )
        });
        assert_eq!(ephemeral_opens, 1);
        // Insert feeds the ephemeral tree, and the DESC output loop steps
        // backward from the last entry.
        assert_eq!(
            count_matching(&program, |i| matches!(i, Instruction::Insert { .. })),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Rewind { to_end: true, .. }
            )),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Step { forward: false, .. }
            )),
            1
        );
        Ok(())
    }

    #[test]
    fn insert_zero_fills_unlisted_columns() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "INSERT INTO t (k) VALUES (9)")?;
        // One load per column: two zero fills plus the key literal.
        assert_eq!(
            count_matching(&program, |i| matches!(i, Instruction::Load { .. })),
            3
        );
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Insert { count: 3, .. }
            )),
            1
        );
        Ok(())
    }

    #[test]
    fn transaction_statements_are_single_opcode_programs() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "BEGIN")?;
        assert!(matches!(program[0], Instruction::Begin));
        assert!(matches!(program[1], Instruction::Halt { code: 0 }));
        assert_eq!(program.len(), 2);
        Ok(())
    }

    #[test]
    fn delete_branches_on_the_still_valid_flag() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "DELETE FROM t WHERE n = 1")?;
        assert_eq!(
            count_matching(&program, |i| matches!(i, Instruction::Delete { .. })),
            1
        );
        // Restart-from-first fallback plus the initial rewind.
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Rewind { to_end: false, .. }
            )),
            2
        );
        Ok(())
    }

    #[test]
    fn create_table_emits_function_call_and_master_insert() -> Result<()> {
        let (_pager, mut catalog, _dir) = setup()?;
        let program = compile(&mut catalog, "CREATE TABLE fresh (id INT, label TEXT)")?;
        assert_eq!(
            count_matching(&program, |i| matches!(i, Instruction::Function { .. })),
            1
        );
        assert_eq!(
            count_matching(&program, |i| matches!(
                i,
                Instruction::Insert { count: 5, .. }
            )),
            1
        );
        Ok(())
    }
}
