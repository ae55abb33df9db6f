use anyhow::{Error, Result};

use crate::common::{ArithOp, CompareOp, LogicOp, REGISTERS};
use crate::types::Value;
use crate::vm::{CursorContext, Instruction, VmFunction};

/// Registers are handed out linearly; loops and conditionals push a scope
/// so their temporaries are released on exit instead of leaking one slot
/// per iteration of compilation.
#[derive(Debug, Default)]
pub struct RegisterAllocator {
    next_free: usize,
    scope_stack: Vec<usize>,
}

impl RegisterAllocator {
    pub fn allocate(&mut self) -> Result<usize> {
        if self.next_free >= REGISTERS {
            return Err(Error::msg("out of registers"));
        }
        let reg = self.next_free;
        self.next_free += 1;
        Ok(reg)
    }

    pub fn allocate_range(&mut self, count: usize) -> Result<usize> {
        if self.next_free + count > REGISTERS {
            return Err(Error::msg("not enough registers for the range"));
        }
        let first = self.next_free;
        self.next_free += count;
        Ok(first)
    }

    pub fn push_scope(&mut self) {
        self.scope_stack.push(self.next_free);
    }

    pub fn pop_scope(&mut self) -> Result<()> {
        let mark = self
            .scope_stack
            .pop()
            .ok_or_else(|| Error::msg("no register scope to pop"))?;
        self.next_free = mark;
        Ok(())
    }

    pub fn mark(&self) -> usize {
        self.next_free
    }

    pub fn restore(&mut self, mark: usize) {
        debug_assert!(mark <= self.next_free);
        self.next_free = mark;
    }
}

pub type Label = usize;

/// Loop skeleton: the condition register is tested at the top; the body
/// recomputes it (usually via STEP) before jumping back.
pub struct WhileContext {
    loop_label: Label,
    end_label: Label,
    saved_mark: usize,
}

pub struct IfContext {
    else_label: Label,
    end_label: Label,
    saved_mark: usize,
    has_else: bool,
}

/// Collects instructions, resolving symbolic jump targets in a final
/// pass. The emit helpers mirror the opcode set one to one; begin/end
/// pairs wrap the recurring loop and conditional shapes.
#[derive(Default)]
pub struct ProgramBuilder {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    patches: Vec<(usize, Label)>,
    pub regs: RegisterAllocator,
    next_cursor: usize,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        self.labels.len() - 1
    }

    pub fn define_label(&mut self, label: Label) {
        self.labels[label] = Some(self.instructions.len());
    }

    pub fn jump_to(&mut self, label: Label) {
        self.patches.push((self.instructions.len(), label));
        self.emit(Instruction::Goto { target: usize::MAX });
    }

    pub fn jumpif(&mut self, reg: usize, label: Label, jump_if_true: bool) {
        self.patches.push((self.instructions.len(), label));
        self.emit(Instruction::JumpIf {
            reg,
            target: usize::MAX,
            jump_if_true,
        });
    }

    /// Patches every recorded jump and hands back the finished program.
    pub fn finish(mut self) -> Result<Vec<Instruction>> {
        for (index, label) in &self.patches {
            let target = self.labels[*label]
                .ok_or_else(|| Error::msg(format!("jump to undefined label {}", label)))?;
            match &mut self.instructions[*index] {
                Instruction::Goto { target: slot } | Instruction::JumpIf { target: slot, .. } => {
                    *slot = target;
                }
                other => {
                    return Err(Error::msg(format!(
                        "patch points at a non-jump instruction {:?}",
                        other
                    )))
                }
            }
        }
        Ok(self.instructions)
    }

    pub fn halt(&mut self, code: i32) {
        self.emit(Instruction::Halt { code });
    }

    pub fn begin_while(&mut self, condition_reg: usize) -> WhileContext {
        let loop_label = self.new_label();
        let end_label = self.new_label();
        self.define_label(loop_label);
        self.jumpif(condition_reg, end_label, false);
        WhileContext {
            loop_label,
            end_label,
            saved_mark: self.regs.mark(),
        }
    }

    pub fn end_while(&mut self, ctx: WhileContext) {
        self.jump_to(ctx.loop_label);
        self.define_label(ctx.end_label);
        self.regs.restore(ctx.saved_mark);
    }

    pub fn begin_if(&mut self, test_reg: usize) -> IfContext {
        let else_label = self.new_label();
        let end_label = self.new_label();
        self.jumpif(test_reg, else_label, false);
        IfContext {
            else_label,
            end_label,
            saved_mark: self.regs.mark(),
            has_else: false,
        }
    }

    pub fn begin_else(&mut self, ctx: &mut IfContext) {
        self.jump_to(ctx.end_label);
        self.define_label(ctx.else_label);
        ctx.has_else = true;
    }

    pub fn end_if(&mut self, ctx: IfContext) {
        if !ctx.has_else {
            self.define_label(ctx.else_label);
        }
        self.define_label(ctx.end_label);
        self.regs.restore(ctx.saved_mark);
    }

    fn dest_or_allocate(&mut self, dest: Option<usize>) -> Result<usize> {
        match dest {
            Some(reg) => Ok(reg),
            None => self.regs.allocate(),
        }
    }

    pub fn load(&mut self, value: Value, dest: Option<usize>) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Load { dest, value });
        Ok(dest)
    }

    pub fn move_into(&mut self, src: usize, dest: usize) {
        self.emit(Instruction::Move { dest, src });
    }

    pub fn arith(
        &mut self,
        left: usize,
        right: usize,
        op: ArithOp,
        dest: Option<usize>,
    ) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Arith {
            dest,
            left,
            right,
            op,
        });
        Ok(dest)
    }

    pub fn test(
        &mut self,
        left: usize,
        right: usize,
        op: CompareOp,
        dest: Option<usize>,
    ) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Test {
            dest,
            left,
            right,
            op,
        });
        Ok(dest)
    }

    pub fn logic(
        &mut self,
        left: usize,
        right: usize,
        op: LogicOp,
        dest: Option<usize>,
    ) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Logic {
            dest,
            left,
            right,
            op,
        });
        Ok(dest)
    }

    pub fn open_cursor(&mut self, context: CursorContext) -> usize {
        let cursor = self.next_cursor;
        self.next_cursor += 1;
        self.emit(Instruction::Open { cursor, context });
        cursor
    }

    pub fn close_cursor(&mut self, cursor: usize) {
        self.emit(Instruction::Close { cursor });
    }

    pub fn rewind(&mut self, cursor: usize, to_end: bool, dest: Option<usize>) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Rewind {
            cursor,
            dest,
            to_end,
        });
        Ok(dest)
    }

    pub fn first(&mut self, cursor: usize, dest: Option<usize>) -> Result<usize> {
        self.rewind(cursor, false, dest)
    }

    pub fn last(&mut self, cursor: usize, dest: Option<usize>) -> Result<usize> {
        self.rewind(cursor, true, dest)
    }

    pub fn step(&mut self, cursor: usize, forward: bool, dest: Option<usize>) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Step {
            cursor,
            dest,
            forward,
        });
        Ok(dest)
    }

    pub fn next(&mut self, cursor: usize, dest: Option<usize>) -> Result<usize> {
        self.step(cursor, true, dest)
    }

    pub fn prev(&mut self, cursor: usize, dest: Option<usize>) -> Result<usize> {
        self.step(cursor, false, dest)
    }

    pub fn seek(
        &mut self,
        cursor: usize,
        key_reg: usize,
        op: CompareOp,
        dest: Option<usize>,
    ) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Seek {
            cursor,
            key: key_reg,
            dest,
            op,
        });
        Ok(dest)
    }

    pub fn get_column(
        &mut self,
        cursor: usize,
        column: usize,
        dest: Option<usize>,
    ) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Column {
            cursor,
            column,
            dest,
        });
        Ok(dest)
    }

    pub fn get_columns(
        &mut self,
        cursor: usize,
        start_column: usize,
        count: usize,
        first_dest: Option<usize>,
    ) -> Result<usize> {
        let first = match first_dest {
            Some(reg) => reg,
            None => self.regs.allocate_range(count)?,
        };
        for i in 0..count {
            self.emit(Instruction::Column {
                cursor,
                column: start_column + i,
                dest: first + i,
            });
        }
        Ok(first)
    }

    pub fn insert_record(&mut self, cursor: usize, start: usize, count: usize) {
        self.emit(Instruction::Insert {
            cursor,
            start,
            count,
        });
    }

    pub fn update_record(&mut self, cursor: usize, start: usize) {
        self.emit(Instruction::Update { cursor, start });
    }

    pub fn delete_record(&mut self, cursor: usize, occurred: usize, still_valid: usize) {
        self.emit(Instruction::Delete {
            cursor,
            occurred,
            still_valid,
        });
    }

    pub fn result(&mut self, start: usize, count: usize) {
        self.emit(Instruction::ResultRow { start, count });
    }

    pub fn call_function(
        &mut self,
        func: VmFunction,
        first_arg: usize,
        arg_count: usize,
        dest: Option<usize>,
    ) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Function {
            dest,
            func,
            start: first_arg,
            count: arg_count,
        });
        Ok(dest)
    }

    pub fn pack2(&mut self, left: usize, right: usize, dest: Option<usize>) -> Result<usize> {
        let dest = self.dest_or_allocate(dest)?;
        self.emit(Instruction::Pack2 { dest, left, right });
        Ok(dest)
    }

    pub fn unpack2(&mut self, src: usize, first_dest: Option<usize>) -> Result<usize> {
        let first = match first_dest {
            Some(reg) => reg,
            None => self.regs.allocate_range(2)?,
        };
        self.emit(Instruction::Unpack2 { dest: first, src });
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::ProgramBuilder;
    use crate::types::Value;
    use crate::vm::Instruction;

    #[test]
    fn labels_resolve_to_final_program_counters() {
        let mut prog = ProgramBuilder::new();
        let skip = prog.new_label();
        let reg = prog.load(Value::from_u32(1), None).unwrap();
        prog.jumpif(reg, skip, true);
        prog.load(Value::from_u32(2), Some(reg)).unwrap();
        prog.define_label(skip);
        prog.halt(0);

        let program = prog.finish().unwrap();
        let Instruction::JumpIf { target, .. } = program[1] else {
            panic!("expected a JumpIf");
        };
        assert_eq!(target, 3);
    }

    #[test]
    fn undefined_label_is_an_error() {
        let mut prog = ProgramBuilder::new();
        let nowhere = prog.new_label();
        prog.jump_to(nowhere);
        prog.halt(0);
        assert!(prog.finish().is_err());
    }

    #[test]
    fn while_loop_releases_scoped_registers() {
        let mut prog = ProgramBuilder::new();
        let cond = prog.load(Value::from_u32(1), None).unwrap();
        let mark = prog.regs.mark();

        let ctx = prog.begin_while(cond);
        prog.regs.push_scope();
        prog.regs.allocate().unwrap();
        prog.regs.allocate().unwrap();
        prog.regs.pop_scope().unwrap();
        prog.end_while(ctx);

        assert_eq!(prog.regs.mark(), mark);
    }

    #[test]
    fn if_else_defines_both_labels() {
        let mut prog = ProgramBuilder::new();
        let test = prog.load(Value::from_u32(0), None).unwrap();
        let mut ctx = prog.begin_if(test);
        prog.load(Value::from_u32(1), None).unwrap();
        prog.begin_else(&mut ctx);
        prog.load(Value::from_u32(2), None).unwrap();
        prog.end_if(ctx);
        prog.halt(0);

        let program = prog.finish().unwrap();
        // jumpif(false) over the then-branch lands on the else-branch.
        let Instruction::JumpIf { target, .. } = program[1] else {
            panic!("expected a JumpIf");
        };
        assert_eq!(target, 4);
        // The then-branch exits over the else-branch.
        let Instruction::Goto { target } = program[3] else {
            panic!("expected a Goto");
        };
        assert_eq!(target, 5);
    }
}
