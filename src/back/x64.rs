//! The x86-64 lowering backend.
//!
//! [lower_to_x64] walks a [Linkage] and appends NASM-syntax assembly text to
//! a caller-owned buffer: a `bits 64` header, `global`/`extern` declarations,
//! one `.text` body per named function, and a `.rodata` section holding the
//! string constants.  The pass is synchronous and deterministic; the same
//! linkage and target always produce byte-identical output.
//!
//! # Design decisions
//!
//! - **Storage assignment is first-fit.**  There is no liveness analysis:
//!   parameters take the registers their calling convention dictates, every
//!   other virtual register takes the lowest free general-purpose register,
//!   and once those run out the rest spill to aligned slots below `rbp`.
//!   Register and slot choices are fixed for the whole function.
//!
//! - **Memory-to-memory shuffling is hidden in the primitives.**  x86 forbids
//!   two memory operands on one instruction, only `mov` into a register
//!   accepts a 64-bit immediate, and `cmp` cannot take an immediate first.
//!   The emission primitives route stack-to-stack traffic through `rax` (and
//!   `rbx` for stores that need a second temporary), and comparisons against
//!   a left-hand constant swap their operands and invert the predicate.
//!
//! - **One peephole.**  A comparison followed by a branch on its result fuses
//!   into `cmp` + `jcc`; no boolean is materialized.  Everything else is
//!   lowered instruction by instruction.
//!
//! # Calling conventions
//!
//! Both the System V AMD64 ABI and the Microsoft x64 convention are
//! supported, per function and per call site.  Callers save whatever volatile
//! registers hold live values around each call; callees save the non-volatile
//! registers the assigner handed out, pushed ascending after the prologue and
//! popped descending before `leave`.  Windows frames reserve the extra 16
//! bytes of shadow store a callee may spill into.

use derive_more::Display;
use log::{debug, trace};

use crate::common::{Id, Set};
use crate::ir::{
    ArithOp, CallingConvention, Comparison, Constant, Function, Instruction, Linkage, Operand,
    Primitive, Value,
};

use super::asm::{jcc, setcc, Place, Reg, RegKind, RegSet, Slot};

/// Primary emission temporary; also the return-value and syscall-number
/// register.
const TEMP: Reg = Reg::Rax;

/// Secondary temporary, for stores that keep an address in [TEMP].
const TEMP2: Reg = Reg::Rbx;

/// System V integer parameter registers, in order.
const SYSV_PARAMS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Microsoft x64 integer parameter registers, in order.
const WIN64_PARAMS: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];

/// Lowering targets.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    /// Unix-like x86-64; functions default to the System V ABI.
    #[display("sysv-x64")]
    SysV64,
    /// Windows x86-64; functions default to the Microsoft x64 convention.
    #[display("x64-windows")]
    Windows,
}

impl Target {
    fn default_convention(self) -> CallingConvention {
        match self {
            Target::SysV64 => CallingConvention::SysV64,
            Target::Windows => CallingConvention::Win64,
        }
    }
}

/// Reasons a lowering invocation stops.  The output buffer keeps everything
/// emitted up to the faulting instruction.
#[derive(Debug, Display, PartialEq, Eq)]
pub enum LowerError {
    /// A function or call site requested a convention this backend cannot
    /// assign registers for.
    #[display("cannot assign registers for calling convention '{_0}'")]
    UnsupportedConvention(CallingConvention),
    /// System V calls pass at most six register arguments here; spilling the
    /// rest to the stack is not implemented.
    #[display("sysv calls take at most 6 arguments, got {_0}")]
    TooManyArguments(usize),
    /// An operand referenced a virtual register, constant, or type that does
    /// not exist, or an instruction stream contradicted its own shape.
    #[display("malformed ir: {_0}")]
    MalformedIr(String),
}

impl std::error::Error for LowerError {}

/// Size and alignment of a primitive on this target, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Bytes a value occupies.
    pub size: u32,
    /// Required alignment of its slot.
    pub alignment: u32,
}

/// The storage layout of a primitive.  `f32` is promoted to an 8-byte slot;
/// aggregate layout is out of scope here.
pub fn layout_of(prim: Primitive) -> Layout {
    use Primitive::*;
    let (size, alignment) = match prim {
        Boolean | S8 | U8 => (1, 1),
        S16 | U16 => (2, 2),
        S32 | U32 => (4, 4),
        S64 | U64 | Pointer => (8, 8),
        F32 | F64 => (8, 8),
    };
    Layout { size, alignment }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Per-function lowering state: the storage assignment, the frame, and the
/// output buffer.  Created fresh for every function and dropped before the
/// next one begins.
struct Context<'a> {
    linkage: &'a Linkage,
    fun: &'a Function,
    fun_index: usize,
    buf: &'a mut String,
    /// The function's convention after target-default resolution.
    cc: CallingConvention,
    /// Storage layout of each virtual register.
    reg_layouts: Vec<Layout>,
    /// Storage slot of each virtual register.
    slots: Vec<Slot>,
    /// Local-slot bytes, rounded to a 16-byte multiple (plus shadow store on
    /// Windows).
    frame_size: u32,
    /// Registers holding non-parameter virtuals; call sites save these.
    occupied: RegSet,
    /// Non-volatile registers the prologue saves and the epilogue restores.
    clobbered: RegSet,
}

impl<'a> Context<'a> {
    fn new(
        linkage: &'a Linkage,
        fun: &'a Function,
        fun_index: usize,
        cc: CallingConvention,
        buf: &'a mut String,
    ) -> Result<Context<'a>, LowerError> {
        let mut reg_layouts = Vec::with_capacity(fun.types.len());
        let mut kinds = Vec::with_capacity(fun.types.len());
        for (i, &type_id) in fun.types.iter().enumerate() {
            let prim = linkage.type_defs.get(type_id as usize).copied().ok_or_else(|| {
                LowerError::MalformedIr(format!("virtual register {i} has unknown type id {type_id}"))
            })?;
            reg_layouts.push(layout_of(prim));
            kinds.push(RegKind::of(prim));
        }
        let mut ctx = Context {
            linkage,
            fun,
            fun_index,
            buf,
            cc,
            reg_layouts,
            slots: Vec::new(),
            frame_size: 0,
            occupied: RegSet::EMPTY,
            clobbered: RegSet::EMPTY,
        };
        ctx.assign_registers(&kinds)?;
        Ok(ctx)
    }

    /// Assign every virtual register a slot: ABI registers for parameters,
    /// first-fit free registers for the rest, aligned stack slots once the
    /// registers run out.
    fn assign_registers(&mut self, kinds: &[RegKind]) -> Result<(), LowerError> {
        let (params, non_volatile) = match self.cc {
            CallingConvention::SysV64 => (
                &SYSV_PARAMS[..],
                RegSet::of(&[Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15]),
            ),
            CallingConvention::Win64 => (
                &WIN64_PARAMS[..],
                RegSet::of(&[
                    Reg::Rbx,
                    Reg::Rsi,
                    Reg::Rdi,
                    Reg::R12,
                    Reg::R13,
                    Reg::R14,
                    Reg::R15,
                ]),
            ),
            CallingConvention::Default => {
                return Err(LowerError::UnsupportedConvention(self.cc));
            }
        };

        // rsp/rbp frame the function, rax/rbx stay free for the emission
        // primitives.  Parameter registers are reserved too, so the first-fit
        // pass can never hand one to a later virtual.
        let mut assigned = RegSet::of(&[Reg::Rsp, Reg::Rbp, TEMP, TEMP2]);
        let mut occupied = RegSet::EMPTY;
        let mut next_offset = 0u32;

        for i in 0..self.fun.register_count() {
            let kind = kinds[i as usize];
            let place = if i < self.fun.parameter_count {
                if (i as usize) < params.len() {
                    let reg = params[i as usize];
                    assigned.insert(reg);
                    Place::Reg(reg.index())
                } else {
                    // Past the saved base pointer and the return address.
                    Place::Param((i - params.len() as u32) * 8 + 16)
                }
            } else if let Some(reg) = assigned.first_free() {
                assigned.insert(reg);
                occupied.insert(reg);
                Place::Reg(reg.index())
            } else {
                let layout = self.reg_layouts[i as usize];
                next_offset = align_up(next_offset, layout.alignment) + layout.size;
                Place::Local(next_offset)
            };
            let slot = Slot { kind, place };
            trace!("v{i} -> {slot}");
            self.slots.push(slot);
        }

        self.frame_size = align_up(next_offset, 16);
        if self.cc == CallingConvention::Win64 {
            // Shadow-store area the callee may spill into.
            self.frame_size += 16;
        }
        self.occupied = occupied;
        self.clobbered = assigned & non_volatile;
        Ok(())
    }

    fn push(&mut self, text: &str) {
        self.buf.push_str(text);
    }

    // Operand resolution ---------------------------------------------------

    fn constant(&self, index: u32) -> Result<&Constant, LowerError> {
        self.fun
            .constants
            .get(index as usize)
            .ok_or_else(|| LowerError::MalformedIr(format!("constant {index} out of range")))
    }

    fn prim_of(&self, operand: Operand) -> Result<Primitive, LowerError> {
        let type_id = self.fun.operand_type(operand).ok_or_else(|| {
            LowerError::MalformedIr(format!("operand {} out of range", operand.0))
        })?;
        self.linkage
            .type_defs
            .get(type_id as usize)
            .copied()
            .ok_or_else(|| LowerError::MalformedIr(format!("unknown type id {type_id}")))
    }

    /// The width class that holds this operand.
    fn kind_of(&self, operand: Operand) -> Result<RegKind, LowerError> {
        Ok(RegKind::of(self.prim_of(operand)?))
    }

    fn slot_of(&self, operand: Operand) -> Option<Slot> {
        operand
            .as_register()
            .and_then(|i| self.slots.get(i as usize).copied())
    }

    /// Constants are never stack-resident.
    fn is_stack(&self, operand: Operand) -> bool {
        self.slot_of(operand).is_some_and(|slot| slot.on_stack())
    }

    /// Does this operand live in exactly the given physical register?
    fn in_reg(&self, operand: Operand, reg: Reg) -> bool {
        matches!(
            self.slot_of(operand),
            Some(Slot { place: Place::Reg(index), .. }) if index == reg.index()
        )
    }

    /// Render an operand to NASM: the assigned slot for virtual registers, a
    /// `.rodata` label for string constants, the literal otherwise.
    fn operand(&self, operand: Operand) -> Result<String, LowerError> {
        if let Some(index) = operand.as_constant() {
            Ok(match &self.constant(index)?.value {
                Value::Integer(v) => v.to_string(),
                Value::String(_) => format!("CONST_{}_{}", self.fun_index, index),
                Value::Symbol(sym) => sym.to_string(),
            })
        } else {
            let index = operand.0 as usize;
            let slot = self.slots.get(index).ok_or_else(|| {
                LowerError::MalformedIr(format!("virtual register {index} out of range"))
            })?;
            Ok(slot.to_string())
        }
    }

    fn label(&self, id: u32) -> String {
        format!("label_{}_{}", self.fun_index, id)
    }

    // Emission primitives --------------------------------------------------

    /// `op dest, src`, routing through a temporary when both operands live on
    /// the stack.
    fn binop(&mut self, op: &str, dest: Operand, src: Operand) -> Result<(), LowerError> {
        if self.is_stack(dest) && self.is_stack(src) {
            let temp = Slot::reg(self.kind_of(dest)?, TEMP);
            self.push(&format!("mov {}, {}\n", temp, self.operand(src)?));
            self.push(&format!("{} {}, {}\n", op, self.operand(dest)?, temp));
        } else {
            self.push(&format!(
                "{} {}, {}\n",
                op,
                self.operand(dest)?,
                self.operand(src)?
            ));
        }
        Ok(())
    }

    /// `dest = lhs op rhs` as a move plus a compound-assignment binop.
    fn threeop(&mut self, op: &str, dest: Operand, lhs: Operand, rhs: Operand) -> Result<(), LowerError> {
        self.mov(dest, lhs)?;
        self.binop(op, dest, rhs)
    }

    /// Like [Context::threeop], for opcodes whose destination cannot be a
    /// memory operand (`imul`): operate in the temporary, spill after.
    fn threeop_nodeststack(
        &mut self,
        op: &str,
        dest: Operand,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<(), LowerError> {
        if self.is_stack(dest) {
            self.mov_to_reg(TEMP, lhs)?;
            let temp = Slot::reg(self.kind_of(dest)?, TEMP);
            self.push(&format!("{} {}, {}\n", op, temp, self.operand(rhs)?));
            self.mov_from_reg(dest, TEMP)
        } else {
            self.threeop(op, dest, lhs, rhs)
        }
    }

    /// `dest = *src`.  Stack-resident operands route through [TEMP]: the
    /// address-carrying temporary takes the pointer's width, the loaded value
    /// takes the destination's.
    fn load(&mut self, dest: Operand, src: Operand) -> Result<(), LowerError> {
        let src_stack = self.is_stack(src);
        let dest_stack = self.is_stack(dest);
        if !src_stack && !dest_stack {
            self.push(&format!(
                "mov {}, [{}]\n",
                self.operand(dest)?,
                self.operand(src)?
            ));
        } else if src_stack && dest_stack {
            let addr = Slot::reg(self.kind_of(src)?, TEMP);
            let value = Slot::reg(self.kind_of(dest)?, TEMP);
            self.push(&format!("mov {}, {}\n", addr, self.operand(src)?));
            self.push(&format!("mov {}, [{}]\n", value, addr));
            self.push(&format!("mov {}, {}\n", self.operand(dest)?, value));
        } else if src_stack {
            let addr = Slot::reg(self.kind_of(src)?, TEMP);
            self.push(&format!("mov {}, {}\n", addr, self.operand(src)?));
            self.push(&format!("mov {}, [{}]\n", self.operand(dest)?, addr));
        } else {
            let value = Slot::reg(self.kind_of(dest)?, TEMP);
            self.push(&format!("mov {}, [{}]\n", value, self.operand(src)?));
            self.push(&format!("mov {}, {}\n", self.operand(dest)?, value));
        }
        Ok(())
    }

    /// `*dest = src`.  The size prefix comes from the source's width.  When
    /// both operands live on the stack the address goes through [TEMP] and
    /// the value through [TEMP2].
    fn store(&mut self, dest: Operand, src: Operand) -> Result<(), LowerError> {
        let src_stack = self.is_stack(src);
        let dest_stack = self.is_stack(dest);
        let size = self.kind_of(src)?.size_keyword();
        if !src_stack && !dest_stack {
            self.push(&format!(
                "mov {} [{}], {}\n",
                size,
                self.operand(dest)?,
                self.operand(src)?
            ));
        } else if src_stack && dest_stack {
            let addr = Slot::reg(self.kind_of(dest)?, TEMP);
            let value = Slot::reg(self.kind_of(src)?, TEMP2);
            self.push(&format!("mov {}, {}\n", addr, self.operand(dest)?));
            self.push(&format!("mov {}, {}\n", value, self.operand(src)?));
            self.push(&format!("mov {} [{}], {}\n", size, addr, value));
        } else if src_stack {
            let value = Slot::reg(self.kind_of(src)?, TEMP);
            self.push(&format!("mov {}, {}\n", value, self.operand(src)?));
            self.push(&format!(
                "mov {} [{}], {}\n",
                size,
                self.operand(dest)?,
                value
            ));
        } else {
            let addr = Slot::reg(self.kind_of(dest)?, TEMP);
            self.push(&format!("mov {}, {}\n", addr, self.operand(dest)?));
            self.push(&format!(
                "mov {} [{}], {}\n",
                size,
                addr,
                self.operand(src)?
            ));
        }
        Ok(())
    }

    /// Move between virtual operands; self-moves vanish.
    fn mov(&mut self, dest: Operand, src: Operand) -> Result<(), LowerError> {
        if dest == src {
            return Ok(());
        }
        self.binop("mov", dest, src)
    }

    /// Move an operand into a fixed physical register, elided when the
    /// operand already lives there.
    fn mov_to_reg(&mut self, reg: Reg, src: Operand) -> Result<(), LowerError> {
        if self.in_reg(src, reg) {
            return Ok(());
        }
        let slot = Slot::reg(self.kind_of(src)?, reg);
        self.push(&format!("mov {}, {}\n", slot, self.operand(src)?));
        Ok(())
    }

    /// Move a fixed physical register into an operand, elided when the
    /// operand already lives there.
    fn mov_from_reg(&mut self, dest: Operand, reg: Reg) -> Result<(), LowerError> {
        if self.in_reg(dest, reg) {
            return Ok(());
        }
        let slot = Slot::reg(self.kind_of(dest)?, reg);
        self.push(&format!("mov {}, {}\n", self.operand(dest)?, slot));
        Ok(())
    }

    fn push_reg(&mut self, reg: Reg) {
        self.push(&format!("push {reg}\n"));
    }

    fn pop_reg(&mut self, reg: Reg) {
        self.push(&format!("pop {reg}\n"));
    }

    /// Save a register on the stack, then load a call argument into it.  The
    /// matching pop restores the old value after the call.
    fn mov_save(&mut self, reg: Reg, src: Operand) -> Result<(), LowerError> {
        self.push_reg(reg);
        self.mov_to_reg(reg, src)
    }

    // Instruction lowering -------------------------------------------------

    /// Function label and prologue: frame setup, then the non-volatile saves
    /// in ascending file order.
    fn prologue(&mut self, link_name: Id) {
        self.push(&format!("\n{link_name}:\n"));
        self.push(&format!(
            "push rbp\nmov rbp, rsp\nsub rsp, {}\n",
            self.frame_size
        ));
        for reg in self.clobbered.iter() {
            self.push_reg(reg);
        }
    }

    /// Return: result into `rax`, non-volatile restores in descending file
    /// order, `leave`, `ret`.
    fn ret(&mut self, value: Option<Operand>) -> Result<(), LowerError> {
        if let Some(value) = value {
            self.mov_to_reg(TEMP, value)?;
        }
        for reg in self.clobbered.iter().rev() {
            self.pop_reg(reg);
        }
        self.push("leave\nret\n");
        Ok(())
    }

    /// The 8-bit rendering of a comparison destination (`setcc` writes one
    /// byte).
    fn low_byte(&self, operand: Operand) -> Result<String, LowerError> {
        let slot = self.slot_of(operand).ok_or_else(|| {
            LowerError::MalformedIr("comparison destination must be a virtual register".into())
        })?;
        Ok(Slot { kind: RegKind::W8, place: slot.place }.to_string())
    }

    /// Emit a comparison, fusing it with a directly following branch on its
    /// result.  Returns true when that branch was consumed.
    fn compare(
        &mut self,
        index: usize,
        op: Comparison,
        dest: Operand,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<bool, LowerError> {
        let mut op = op;
        if lhs.as_constant().is_some() {
            // cmp cannot take an immediate first: swap and invert.
            op = op.inverse();
            self.binop("cmp", rhs, lhs)?;
        } else {
            self.binop("cmp", lhs, rhs)?;
        }
        match self.fun.instructions.get(index + 1) {
            Some(&Instruction::Branch { cond, to }) if cond == dest => {
                let target = self.label(to);
                self.push(&format!("{} {}\n", jcc(op), target));
                Ok(true)
            }
            Some(&Instruction::BranchNot { cond, to }) if cond == dest => {
                let target = self.label(to);
                self.push(&format!("{} {}\n", jcc(op.inverse()), target));
                Ok(true)
            }
            _ => {
                // Materialize the boolean: clear the destination, set its low
                // byte.
                if self.kind_of(dest)? != RegKind::W8 {
                    self.binop("xor", dest, dest)?;
                }
                let low = self.low_byte(dest)?;
                self.push(&format!("{} {}\n", setcc(op), low));
                Ok(false)
            }
        }
    }

    /// A branch that was not fused tests its own condition.
    fn branch(&mut self, cond: Operand, to: u32, invert: bool) -> Result<(), LowerError> {
        self.binop("test", cond, cond)?;
        let target = self.label(to);
        self.push(&format!("{} {}\n", if invert { "jz" } else { "jnz" }, target));
        Ok(())
    }

    /// Width-changing move.  Writing a 32-bit register name zeroes the upper
    /// half, so 32-to-64 widening zero-extends; narrowing just uses the
    /// smaller name class.  Other sign extensions are the producer's problem.
    fn cast(&mut self, dest: Operand, src: Operand) -> Result<(), LowerError> {
        let srckind = self.kind_of(src)?;
        let destkind = self.kind_of(dest)?;
        if srckind == destkind {
            return self.mov(dest, src);
        }
        // Route through the source's own register when it has one.
        let route = match self.slot_of(src) {
            Some(Slot { place: Place::Reg(index), .. }) => Reg::from_index(index),
            _ => TEMP,
        };
        self.mov_to_reg(route, src)?;
        self.mov_from_reg(dest, route)
    }

    fn call(
        &mut self,
        index: usize,
        dest: Option<Operand>,
        callee: Operand,
        conv: CallingConvention,
        arg_count: u32,
        syscall: bool,
    ) -> Result<(), LowerError> {
        let args = self.fun.call_args(index, arg_count);
        if args.len() != arg_count as usize {
            return Err(LowerError::MalformedIr(format!(
                "call expects {arg_count} packed arguments, found {}",
                args.len()
            )));
        }
        let conv = match conv {
            CallingConvention::Default => self.cc,
            other => other,
        };
        match conv {
            CallingConvention::SysV64 => self.sysv_call(dest, callee, syscall, &args),
            CallingConvention::Win64 => self.win64_call(dest, callee, syscall, &args),
            CallingConvention::Default => Err(LowerError::UnsupportedConvention(conv)),
        }
    }

    /// System V call framing: argument registers are loaded with [Context::mov_save]
    /// so their old values survive, other live volatiles are pushed, and
    /// everything is popped in reverse after the call.
    fn sysv_call(
        &mut self,
        dest: Option<Operand>,
        callee: Operand,
        syscall: bool,
        args: &[Operand],
    ) -> Result<(), LowerError> {
        if args.len() > SYSV_PARAMS.len() {
            return Err(LowerError::TooManyArguments(args.len()));
        }
        let mut saved = Vec::new();
        for (k, &reg) in SYSV_PARAMS.iter().enumerate() {
            if k < args.len() {
                self.mov_save(reg, args[k])?;
                saved.push(reg);
            } else if self.occupied.contains(reg) {
                self.push_reg(reg);
                saved.push(reg);
            }
        }
        for reg in [Reg::R10, Reg::R11] {
            if self.occupied.contains(reg) {
                self.push_reg(reg);
                saved.push(reg);
            }
        }
        if syscall {
            self.mov_to_reg(TEMP, callee)?;
            self.push("syscall\n");
        } else {
            // rax counts the vector arguments for variadic callees; none here.
            self.push("mov rax, 0\n");
            self.push(&format!("call {}\n", self.operand(callee)?));
        }
        if let Some(dest) = dest {
            self.mov_from_reg(dest, TEMP)?;
        }
        for reg in saved.into_iter().rev() {
            self.pop_reg(reg);
        }
        Ok(())
    }

    /// Microsoft x64 call framing: four register arguments, the rest pushed
    /// right-to-left and cleaned up by the caller after the call.
    fn win64_call(
        &mut self,
        dest: Option<Operand>,
        callee: Operand,
        syscall: bool,
        args: &[Operand],
    ) -> Result<(), LowerError> {
        let mut saved = Vec::new();
        for (k, &reg) in WIN64_PARAMS.iter().enumerate() {
            if k < args.len() {
                self.mov_save(reg, args[k])?;
                saved.push(reg);
            } else if self.occupied.contains(reg) {
                self.push_reg(reg);
                saved.push(reg);
            }
        }
        for reg in [Reg::R10, Reg::R11] {
            if self.occupied.contains(reg) {
                self.push_reg(reg);
                saved.push(reg);
            }
        }
        for &arg in args.iter().skip(WIN64_PARAMS.len()).rev() {
            self.push(&format!("push {}\n", self.operand(arg)?));
        }
        if syscall {
            self.mov_to_reg(TEMP, callee)?;
            self.push("syscall\n");
        } else {
            self.push(&format!("call {}\n", self.operand(callee)?));
        }
        if args.len() > WIN64_PARAMS.len() {
            self.push(&format!(
                "add rsp, {}\n",
                8 * (args.len() - WIN64_PARAMS.len())
            ));
        }
        if let Some(dest) = dest {
            self.mov_from_reg(dest, TEMP)?;
        }
        for reg in saved.into_iter().rev() {
            self.pop_reg(reg);
        }
        Ok(())
    }

    /// Lower the instruction stream.
    fn body(&mut self) -> Result<(), LowerError> {
        use Instruction::*;

        let fun = self.fun;
        let mut index = 0;
        while index < fun.instructions.len() {
            let instruction = &fun.instructions[index];
            match *instruction {
                Arith { op, dest, lhs, rhs } => {
                    let mnemonic = match op {
                        ArithOp::Add | ArithOp::PointerAdd => "add",
                        ArithOp::Sub | ArithOp::PointerSub => "sub",
                        ArithOp::Mul => "imul",
                        ArithOp::Div => "idiv",
                        ArithOp::And => "and",
                        ArithOp::Or => "or",
                        ArithOp::Xor => "xor",
                        ArithOp::Shl => "shl",
                        ArithOp::Shr => "shr",
                    };
                    if op == ArithOp::Mul {
                        self.threeop_nodeststack(mnemonic, dest, lhs, rhs)?;
                    } else {
                        self.threeop(mnemonic, dest, lhs, rhs)?;
                    }
                }
                Compare { op, dest, lhs, rhs } => {
                    if self.compare(index, op, dest, lhs, rhs)? {
                        // The branch was fused away.
                        index += 1;
                    }
                }
                Move { dest, src } => self.mov(dest, src)?,
                Cast { dest, src } => self.cast(dest, src)?,
                Load { dest, src } => self.load(dest, src)?,
                Store { dest, src } => self.store(dest, src)?,
                Label { id } => {
                    let label = self.label(id);
                    self.push(&format!("{label}:\n"));
                }
                Jump { to } => {
                    let label = self.label(to);
                    self.push(&format!("jmp {label}\n"));
                }
                Branch { cond, to } => self.branch(cond, to, false)?,
                BranchNot { cond, to } => self.branch(cond, to, true)?,
                Call { dest, callee, conv, arg_count } => {
                    self.call(index, dest, callee, conv, arg_count, false)?;
                }
                Syscall { dest, callee, conv, arg_count } => {
                    self.call(index, dest, callee, conv, arg_count, true)?;
                }
                Return { value } => self.ret(value)?,
                // Metadata and packed call arguments produce no code.
                Arg { .. } | TypePrimitive { .. } | TypePointer { .. } | TypeBind { .. } => {}
                Address { .. } | FieldPointer { .. } | ArrayPointer { .. } => {
                    self.push(&format!("; nyi: {}\n", instruction.name()));
                }
            }
            index += 1;
        }
        Ok(())
    }
}

/// Lower a linkage unit to NASM-syntax x86-64 assembly, appended to `out`.
///
/// Emission order is a function of the input alone: header, `global` lines
/// for every named function, `extern` lines for symbol constants nothing here
/// defines, the `.text` bodies, then the `.rodata` string constants.
pub fn lower_to_x64(
    linkage: &Linkage,
    target: Target,
    out: &mut String,
) -> Result<(), LowerError> {
    out.push_str("bits 64\ndefault rel\n\n");

    let mut seen: Set<Id> = Set::new();
    for fun in &linkage.functions {
        if let Some(name) = fun.link_name {
            seen.insert(name);
            out.push_str(&format!("global {name}\n"));
        }
    }
    for fun in &linkage.functions {
        for constant in &fun.constants {
            if let Value::Symbol(sym) = &constant.value {
                if seen.insert(*sym) {
                    out.push_str(&format!("extern {sym}\n"));
                }
            }
        }
    }

    out.push_str("\nsection .text\n");

    for (fun_index, fun) in linkage.functions.iter().enumerate() {
        // Unnamed functions only carry type definitions; they produce no code.
        let Some(link_name) = fun.link_name else {
            continue;
        };
        let cc = match fun.calling_convention {
            CallingConvention::Default => target.default_convention(),
            other => other,
        };
        debug!(
            "lowering {link_name}: {} instructions, {cc}",
            fun.instructions.len()
        );
        let mut ctx = Context::new(linkage, fun, fun_index, cc, out)?;
        ctx.prologue(link_name);
        ctx.body()?;
    }

    out.push_str("\nsection .rodata\n");
    for (fun_index, fun) in linkage.functions.iter().enumerate() {
        for (index, constant) in fun.constants.iter().enumerate() {
            if let Value::String(bytes) = &constant.value {
                emit_string_constant(out, fun_index, index, bytes);
            }
        }
    }
    Ok(())
}

/// One NASM `db` line for a string constant: printable runs quoted, control
/// and non-ASCII bytes as decimal literals, a zero terminator last.  NASM
/// quoted strings cannot hold the quote byte itself, so it goes out as a
/// literal too.
fn emit_string_constant(out: &mut String, fun_index: usize, index: usize, bytes: &[u8]) {
    out.push_str(&format!("CONST_{fun_index}_{index}: db "));
    let mut in_string = false;
    for (i, &byte) in bytes.iter().enumerate() {
        let quotable = (32..127).contains(&byte) && byte != b'"';
        if quotable {
            if !in_string {
                out.push_str(if i == 0 { "\"" } else { ", \"" });
            }
            out.push(byte as char);
            in_string = true;
        } else {
            if in_string {
                out.push_str(&format!("\", {byte}"));
            } else if i == 0 {
                out.push_str(&format!("{byte}"));
            } else {
                out.push_str(&format!(", {byte}"));
            }
            in_string = false;
        }
    }
    if in_string {
        out.push_str("\", 0\n");
    } else if bytes.is_empty() {
        out.push_str("0\n");
    } else {
        out.push_str(", 0\n");
    }
}
