use std::collections::HashMap;
use std::fmt::Display;

use anyhow::{Error, Result};
use tracing::warn;

use crate::catalog::Catalog;
use crate::common::{ArithOp, CompareOp, LogicOp, REGISTERS};
use crate::storage::btree::{BTree, BTreeCursor, DeleteOutcome};
use crate::storage::memtree::{MemTree, MemTreeCursor};
use crate::storage::pager::Pager;
use crate::types::{TupleFormat, Value};

/// Host functions the compiler can reference. Both mutate the catalog, so
/// any later failure in the same program has to surface as an abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmFunction {
    CreateRelation,
    DropRelation,
}

#[derive(Clone, Debug)]
pub enum CursorTarget {
    BTree(BTree),
    Ephemeral { allow_duplicates: bool },
}

/// Everything OPEN needs to build a cursor: the tree to bind and the tuple
/// layout its rows follow.
#[derive(Clone, Debug)]
pub struct CursorContext {
    pub target: CursorTarget,
    pub format: TupleFormat,
}

#[derive(Clone, Debug)]
pub enum Instruction {
    Load {
        dest: usize,
        value: Value,
    },
    Move {
        dest: usize,
        src: usize,
    },
    Arith {
        dest: usize,
        left: usize,
        right: usize,
        op: ArithOp,
    },
    Test {
        dest: usize,
        left: usize,
        right: usize,
        op: CompareOp,
    },
    Logic {
        dest: usize,
        left: usize,
        right: usize,
        op: LogicOp,
    },
    Goto {
        target: usize,
    },
    JumpIf {
        reg: usize,
        target: usize,
        jump_if_true: bool,
    },
    Open {
        cursor: usize,
        context: CursorContext,
    },
    Close {
        cursor: usize,
    },
    Rewind {
        cursor: usize,
        dest: usize,
        to_end: bool,
    },
    Step {
        cursor: usize,
        dest: usize,
        forward: bool,
    },
    Seek {
        cursor: usize,
        key: usize,
        dest: usize,
        op: CompareOp,
    },
    Column {
        cursor: usize,
        column: usize,
        dest: usize,
    },
    Insert {
        cursor: usize,
        start: usize,
        count: usize,
    },
    Update {
        cursor: usize,
        start: usize,
    },
    Delete {
        cursor: usize,
        occurred: usize,
        still_valid: usize,
    },
    ResultRow {
        start: usize,
        count: usize,
    },
    Function {
        dest: usize,
        func: VmFunction,
        start: usize,
        count: usize,
    },
    Begin,
    Commit,
    Rollback,
    Pack2 {
        dest: usize,
        left: usize,
        right: usize,
    },
    Unpack2 {
        dest: usize,
        src: usize,
    },
    Halt {
        code: i32,
    },
}

/// How a program run failed. Abort means a host function already mutated
/// the catalog, so the caller must reload it after rolling back; Fail
/// leaves the catalog untouched.
#[derive(Debug)]
pub enum VmError {
    Abort(String),
    Fail(String),
}

impl Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Abort(msg) => write!(f, "program aborted: {}", msg),
            VmError::Fail(msg) => write!(f, "program failed: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

#[derive(Clone, Debug, Default)]
enum Register {
    #[default]
    Empty,
    Single(Value),
    Pair(Value, Value),
}

enum VmCursor {
    Tree {
        cursor: BTreeCursor,
        format: TupleFormat,
    },
    Mem {
        tree: MemTree,
        cursor: MemTreeCursor,
        format: TupleFormat,
    },
}

/// Runs a program to HALT. Errors are classified per the catalog-dirty
/// flag; the caller decides between plain rollback and catalog reload.
pub fn execute(
    program: &[Instruction],
    pager: &mut Pager,
    catalog: &mut Catalog,
    on_row: &mut dyn FnMut(&[Value]),
) -> Result<()> {
    let mut machine = Machine {
        registers: vec![Register::Empty; REGISTERS],
        cursors: HashMap::new(),
        catalog_dirty: false,
    };
    match machine.run(program, pager, catalog, on_row) {
        Ok(()) => Ok(()),
        Err(err) => {
            let message = format!("{:#}", err);
            if machine.catalog_dirty {
                warn!(%message, "aborting program after catalog mutation");
                Err(VmError::Abort(message).into())
            } else {
                Err(VmError::Fail(message).into())
            }
        }
    }
}

struct Machine {
    registers: Vec<Register>,
    cursors: HashMap<usize, VmCursor>,
    catalog_dirty: bool,
}

impl Machine {
    fn run(
        &mut self,
        program: &[Instruction],
        pager: &mut Pager,
        catalog: &mut Catalog,
        on_row: &mut dyn FnMut(&[Value]),
    ) -> Result<()> {
        let mut pc = 0usize;
        loop {
            let instruction = program
                .get(pc)
                .ok_or_else(|| Error::msg("program ran past its end without HALT"))?;
            pc += 1;

            match instruction {
                Instruction::Load { dest, value } => {
                    self.registers[*dest] = Register::Single(value.clone());
                }
                Instruction::Move { dest, src } => {
                    self.registers[*dest] = self.registers[*src].clone();
                }
                Instruction::Arith {
                    dest,
                    left,
                    right,
                    op,
                } => {
                    let result = self.value(*left)?.arithmetic(self.value(*right)?, *op)?;
                    self.registers[*dest] = Register::Single(result);
                }
                Instruction::Test {
                    dest,
                    left,
                    right,
                    op,
                } => {
                    let ordering = self.value(*left)?.compare(self.value(*right)?)?;
                    let outcome = match op {
                        CompareOp::Eq => ordering.is_eq(),
                        CompareOp::NotEq => ordering.is_ne(),
                        CompareOp::Less => ordering.is_lt(),
                        CompareOp::LessEq => ordering.is_le(),
                        CompareOp::Greater => ordering.is_gt(),
                        CompareOp::GreaterEq => ordering.is_ge(),
                    };
                    self.set_flag(*dest, outcome);
                }
                Instruction::Logic {
                    dest,
                    left,
                    right,
                    op,
                } => {
                    let left = self.value(*left)?.is_truthy();
                    let right = self.value(*right)?.is_truthy();
                    let outcome = match op {
                        LogicOp::And => left && right,
                        LogicOp::Or => left || right,
                    };
                    self.set_flag(*dest, outcome);
                }
                Instruction::Goto { target } => pc = *target,
                Instruction::JumpIf {
                    reg,
                    target,
                    jump_if_true,
                } => {
                    if self.value(*reg)?.is_truthy() == *jump_if_true {
                        pc = *target;
                    }
                }
                Instruction::Open { cursor, context } => {
                    let opened = match &context.target {
                        CursorTarget::BTree(tree) => VmCursor::Tree {
                            cursor: BTreeCursor::new(*tree),
                            format: context.format.clone(),
                        },
                        CursorTarget::Ephemeral { allow_duplicates } => VmCursor::Mem {
                            tree: MemTree::new(context.format.key_type(), *allow_duplicates),
                            cursor: MemTreeCursor::new(),
                            format: context.format.clone(),
                        },
                    };
                    self.cursors.insert(*cursor, opened);
                }
                Instruction::Close { cursor } => {
                    self.cursors.remove(cursor);
                }
                Instruction::Rewind {
                    cursor,
                    dest,
                    to_end,
                } => {
                    let valid = match self.cursor_mut(*cursor)? {
                        VmCursor::Tree { cursor, .. } => {
                            if *to_end {
                                cursor.last(pager)?
                            } else {
                                cursor.first(pager)?
                            }
                        }
                        VmCursor::Mem { tree, cursor, .. } => {
                            if *to_end {
                                cursor.last(tree)
                            } else {
                                cursor.first(tree)
                            }
                        }
                    };
                    self.set_flag(*dest, valid);
                }
                Instruction::Step {
                    cursor,
                    dest,
                    forward,
                } => {
                    let valid = match self.cursor_mut(*cursor)? {
                        VmCursor::Tree { cursor, .. } => {
                            if *forward {
                                cursor.next(pager)?
                            } else {
                                cursor.previous(pager)?
                            }
                        }
                        VmCursor::Mem { tree, cursor, .. } => {
                            if *forward {
                                cursor.next(tree)
                            } else {
                                cursor.previous(tree)
                            }
                        }
                    };
                    self.set_flag(*dest, valid);
                }
                Instruction::Seek {
                    cursor,
                    key,
                    dest,
                    op,
                } => {
                    let key_bytes = self.key_bytes(*key)?;
                    let valid = match self.cursor_mut(*cursor)? {
                        VmCursor::Tree { cursor, .. } => cursor.seek(pager, &key_bytes, *op)?,
                        VmCursor::Mem { tree, cursor, .. } => cursor.seek(tree, &key_bytes, *op)?,
                    };
                    self.set_flag(*dest, valid);
                }
                Instruction::Column {
                    cursor,
                    column,
                    dest,
                } => {
                    let value = self.read_column(pager, *cursor, *column)?;
                    self.registers[*dest] = Register::Single(value);
                }
                Instruction::Insert {
                    cursor,
                    start,
                    count,
                } => {
                    let key_bytes = self.key_bytes(*start)?;
                    let record = self.assemble_record(*start, *count)?;
                    match self.cursor_mut(*cursor)? {
                        VmCursor::Tree { cursor, format } => {
                            if key_bytes.len() != format.key_type().size() {
                                return Err(Error::msg("key width does not match the tree"));
                            }
                            if record.len() != format.record_size {
                                return Err(Error::msg("record width does not match the tree"));
                            }
                            cursor.insert(pager, &key_bytes, &record)?;
                        }
                        VmCursor::Mem { tree, .. } => tree.insert(&key_bytes, &record)?,
                    }
                }
                Instruction::Update { cursor, start } => {
                    let count = match self.cursor_mut(*cursor)? {
                        VmCursor::Tree { format, .. } | VmCursor::Mem { format, .. } => {
                            format.column_count()
                        }
                    };
                    let record = self.assemble_record(*start, count)?;
                    match self.cursor_mut(*cursor)? {
                        VmCursor::Tree { cursor, .. } => cursor.update(pager, &record)?,
                        VmCursor::Mem { tree, cursor, .. } => cursor.update(tree, &record)?,
                    }
                }
                Instruction::Delete {
                    cursor,
                    occurred,
                    still_valid,
                } => {
                    let outcome = match self.cursor_mut(*cursor)? {
                        VmCursor::Tree { cursor, .. } => cursor.delete(pager)?,
                        VmCursor::Mem { tree, cursor, .. } => cursor.delete(tree)?,
                    };
                    self.set_flag(*occurred, true);
                    self.set_flag(*still_valid, outcome == DeleteOutcome::Deleted);
                }
                Instruction::ResultRow { start, count } => {
                    let mut row = Vec::with_capacity(*count);
                    for reg in *start..*start + *count {
                        row.push(self.value(reg)?.clone());
                    }
                    on_row(&row);
                }
                Instruction::Function {
                    dest,
                    func,
                    start,
                    count,
                } => {
                    let result = self.call_function(pager, catalog, *func, *start, *count)?;
                    self.registers[*dest] = Register::Single(result);
                }
                Instruction::Begin => pager.begin_transaction()?,
                Instruction::Commit => pager.commit()?,
                Instruction::Rollback => pager.rollback()?,
                Instruction::Pack2 { dest, left, right } => {
                    let pair =
                        Register::Pair(self.value(*left)?.clone(), self.value(*right)?.clone());
                    self.registers[*dest] = pair;
                }
                Instruction::Unpack2 { dest, src } => match self.registers[*src].clone() {
                    Register::Pair(first, second) => {
                        self.registers[*dest] = Register::Single(first);
                        self.registers[*dest + 1] = Register::Single(second);
                    }
                    _ => return Err(Error::msg("UNPACK2 on a register without a pair")),
                },
                Instruction::Halt { code } => {
                    if *code == 0 {
                        return Ok(());
                    }
                    return Err(Error::msg(format!("program halted with code {}", code)));
                }
            }
        }
    }

    fn value(&self, reg: usize) -> Result<&Value> {
        match self
            .registers
            .get(reg)
            .ok_or_else(|| Error::msg(format!("register {} out of range", reg)))?
        {
            Register::Single(value) => Ok(value),
            Register::Empty => Err(Error::msg(format!("register {} is empty", reg))),
            Register::Pair(..) => Err(Error::msg(format!(
                "register {} holds a pair where a value was expected",
                reg
            ))),
        }
    }

    /// Key bytes for SEEK and INSERT: a plain value's bytes, or the
    /// concatenation of a PACK2 pair.
    fn key_bytes(&self, reg: usize) -> Result<Vec<u8>> {
        match &self.registers[reg] {
            Register::Single(value) => Ok(value.bytes().to_vec()),
            Register::Pair(first, second) => {
                let mut bytes = first.bytes().to_vec();
                bytes.extend_from_slice(second.bytes());
                Ok(bytes)
            }
            Register::Empty => Err(Error::msg(format!("register {} is empty", reg))),
        }
    }

    fn set_flag(&mut self, reg: usize, value: bool) {
        self.registers[reg] = Register::Single(Value::from_u32(value as u32));
    }

    fn cursor_mut(&mut self, id: usize) -> Result<&mut VmCursor> {
        self.cursors
            .get_mut(&id)
            .ok_or_else(|| Error::msg(format!("cursor {} is not open", id)))
    }

    /// Copies column `column` of the current row out of the page into an
    /// owned value; the register must never alias page memory.
    fn read_column(&mut self, pager: &mut Pager, id: usize, column: usize) -> Result<Value> {
        let cursor = self.cursor_mut(id)?;
        match cursor {
            VmCursor::Tree { cursor, format } => {
                let ty = format.columns[column];
                if column == 0 {
                    Ok(Value::from_bytes(ty, &cursor.key_bytes(pager)?))
                } else {
                    let (offset, size) = format.record_range(column);
                    let record = cursor.record_bytes(pager)?;
                    Ok(Value::from_bytes(ty, &record[offset..offset + size]))
                }
            }
            VmCursor::Mem {
                tree,
                cursor,
                format,
            } => {
                let ty = format.columns[column];
                if column == 0 {
                    Ok(Value::from_bytes(ty, &cursor.key_bytes()?))
                } else {
                    let (offset, size) = format.record_range(column);
                    let record = cursor.record_bytes(tree)?;
                    Ok(Value::from_bytes(ty, &record[offset..offset + size]))
                }
            }
        }
    }

    /// Concatenates registers `start+1 .. start+count` into a record.
    fn assemble_record(&self, start: usize, count: usize) -> Result<Vec<u8>> {
        let mut record = Vec::new();
        for reg in start + 1..start + count {
            record.extend_from_slice(self.value(reg)?.bytes());
        }
        Ok(record)
    }

    fn call_function(
        &mut self,
        pager: &mut Pager,
        catalog: &mut Catalog,
        func: VmFunction,
        start: usize,
        count: usize,
    ) -> Result<Value> {
        if count != 1 {
            return Err(Error::msg("host functions take exactly one argument"));
        }
        let name = self.value(start)?.as_str().to_owned();
        match func {
            VmFunction::CreateRelation => {
                self.catalog_dirty = true;
                let format = catalog
                    .require(&name)?
                    .format();
                let tree = BTree::create(pager, format.key_type(), format.record_size, true)?;
                let relation = catalog
                    .get_mut(&name)
                    .ok_or_else(|| Error::msg(format!("unknown table {}", name)))?;
                relation.tree = tree;
                Ok(Value::from_u32(tree.root_page))
            }
            VmFunction::DropRelation => {
                self.catalog_dirty = true;
                let tree = catalog.require(&name)?.tree;
                tree.clear(pager)?;
                catalog.remove(&name);
                Ok(Value::from_u32(1))
            }
        }
    }
}
