//! The instruction compiler.
//!
//! Each function is lowered once: every SSA value gets a dense
//! register index (locals first, then parameters, free variables, and
//! constants/globals/function references as they appear), constants
//! and globals are preloaded into the initial register image, and
//! every instruction becomes a pre-resolved [`Exec`] step. The
//! per-step runtime cost is one match dispatch plus register-array
//! indexing; no map lookups survive to the hot path.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::bridge::{HostFunc, Rtype};
use crate::chan::{self, ChanValue, SelCase};
use crate::error::{EvalResult, Panic};
use crate::interp::{Cont, Deferred, Frame, Interp};
use crate::ops;
use crate::ssa::{
    BinOp, BlockId, Builtin, CallCommon, Const, ConstKind, FuncId, Instr, Operand, UnOp,
};
use crate::types::{ChanDir, Type, TypeKind};
use crate::value::{
    clone_for_store, new_cell, zero, ArrayValue, FuncValue, IterValue, MapIter, MapValue, Pointer,
    SliceValue, StrIter, Value,
};
use crate::value::GoStr;

pub type Reg = u32;

/// Largest admissible slice or channel allocation.
pub const MAX_MEM_LEN: i64 = if cfg!(target_pointer_width = "32") {
    (1 << 31) - 1
} else {
    1 << 59
};

// ── Compiled form ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CompiledBlock {
    pub instrs: Vec<Exec>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
}

/// A function after lowering. Immutable; lives for the engine's
/// lifetime.
pub struct CompiledFunc {
    pub id: FuncId,
    pub name: String,
    pub blocks: Vec<CompiledBlock>,
    pub entry: BlockId,
    pub recover_block: Option<BlockId>,
    pub reg_count: usize,
    /// Initial register contents: constants, globals and function
    /// references are observable from the first instruction.
    pub image: Vec<Value>,
    pub local_types: Vec<Type>,
    pub n_params: usize,
    pub n_free_vars: usize,
    pub results: Vec<Type>,
}

#[derive(Debug, Clone)]
pub struct CompiledCall {
    pub target: CallTarget,
    pub args: Vec<Reg>,
}

#[derive(Debug, Clone)]
pub enum CallTarget {
    /// Interpreted function with a body.
    Compiled(FuncId),
    /// Pre-resolved external callable.
    Native(Arc<HostFunc>),
    Builtin(Builtin),
    /// Function value fetched from a register at call time.
    Dynamic(Reg),
    /// Interface method: resolve against the receiver's dynamic type.
    Invoke { recv: Reg, method: String },
}

#[derive(Debug, Clone)]
pub struct CompiledSel {
    pub is_send: bool,
    pub ch: Reg,
    pub send: Option<Reg>,
    pub elem: Type,
}

#[derive(Debug)]
pub enum Exec {
    AllocHeap { dst: Reg, ty: Type },
    AllocLocal { slot: Reg, ty: Type },
    Phi { dst: Reg, edges: Vec<Reg> },
    Call { dst: Reg, call: CompiledCall },
    // Fast paths for the hottest int operations.
    IntAdd { dst: Reg, x: Reg, y: Reg },
    IntSub { dst: Reg, x: Reg, y: Reg },
    IntMul { dst: Reg, x: Reg, y: Reg },
    IntLss { dst: Reg, x: Reg, y: Reg },
    Bin { op: BinOp, dst: Reg, x: Reg, y: Reg, x_nil: bool, y_nil: bool },
    Un { op: UnOp, dst: Reg, x: Reg, comma_ok: bool },
    ChangeType { dst: Reg, ty: Type, x: Reg },
    Convert { dst: Reg, ty: Type, x: Reg },
    ChangeIface { dst: Reg, x: Reg },
    SliceToArrayPointer { dst: Reg, arr_ty: Type, arr_len: usize, x: Reg },
    MakeIface { dst: Reg, rt: Rtype, x: Reg },
    MakeClosure { dst: Reg, func: FuncId, bindings: Vec<Reg> },
    MakeMap { dst: Reg, key_ty: Type, val_ty: Type, underscore: bool, reserve: Option<Reg> },
    MakeChan { dst: Reg, elem: Type, size: Reg },
    MakeSlice { dst: Reg, elem: Type, len: Reg, cap: Reg },
    SliceOp { dst: Reg, x: Reg, lo: Option<Reg>, hi: Option<Reg>, max: Option<Reg>, from_alloc: bool },
    FieldAddr { dst: Reg, x: Reg, field: usize, field_ty: Type },
    FieldVal { dst: Reg, x: Reg, field: usize },
    IndexAddr { dst: Reg, x: Reg, index: Reg },
    IndexVal { dst: Reg, x: Reg, index: Reg },
    Lookup { dst: Reg, x: Reg, index: Reg, comma_ok: bool, string_x: bool, val_ty: Type },
    SelectOp { dst: Reg, blocking: bool, states: Vec<CompiledSel> },
    RangeOp { dst: Reg, x: Reg },
    NextOp { dst: Reg, iter: Reg },
    TypeAssert { dst: Reg, x: Reg, x_ty: Type, asserted: Type, comma_ok: bool },
    Extract { dst: Reg, tuple: Reg, index: usize },
    Jump,
    If { cond: Reg },
    Return0,
    Return1 { r: Reg },
    ReturnN { rs: Vec<Reg> },
    RunDefers,
    Panic { x: Reg },
    GoStmt { call: CompiledCall },
    DeferStmt { call: CompiledCall },
    Send { ch: Reg, x: Reg },
    Store { addr: Reg, val: Reg },
    MapUpdate { map: Reg, key: Reg, val: Reg },
    DebugRef { name: String, x: Reg },
}

/// Materialize a typed constant.
pub(crate) fn const_value(c: &Const) -> Value {
    match &c.kind {
        ConstKind::Nil => zero(&c.ty),
        ConstKind::Bool(b) => Value::Bool(*b),
        ConstKind::Str(s) => Value::Str(GoStr::from(s.as_slice())),
        ConstKind::Int(i) => match c.ty.underlying().kind() {
            TypeKind::Int => Value::Int(*i),
            TypeKind::Int8 => Value::Int8(*i as i8),
            TypeKind::Int16 => Value::Int16(*i as i16),
            TypeKind::Int32 => Value::Int32(*i as i32),
            TypeKind::Int64 => Value::Int64(*i),
            TypeKind::Uint => Value::Uint(*i as u64),
            TypeKind::Uint8 => Value::Uint8(*i as u8),
            TypeKind::Uint16 => Value::Uint16(*i as u16),
            TypeKind::Uint32 => Value::Uint32(*i as u32),
            TypeKind::Uint64 => Value::Uint64(*i as u64),
            TypeKind::Uintptr => Value::Uintptr(*i as u64),
            TypeKind::Float32 => Value::Float32(*i as f32),
            TypeKind::Float64 => Value::Float64(*i as f64),
            _ => Value::Int(*i),
        },
        ConstKind::Float(f) => match c.ty.underlying().kind() {
            TypeKind::Float32 => Value::Float32(*f as f32),
            _ => Value::Float64(*f),
        },
        ConstKind::Complex(re, im) => match c.ty.underlying().kind() {
            TypeKind::Complex64 => Value::Complex64(*re as f32, *im as f32),
            _ => Value::Complex128(*re, *im),
        },
    }
}

// ── Register assignment and lowering ─────────────────────────────────

#[derive(Hash, PartialEq, Eq)]
enum RegKey {
    Local(usize),
    Param(usize),
    FreeVar(usize),
    Instr(u32),
}

struct FuncCompiler<'i> {
    interp: &'i Interp,
    func_id: FuncId,
    index: FxHashMap<RegKey, Reg>,
    image: Vec<Value>,
    next: Reg,
    /// Flattened instruction numbering, for `RegKey::Instr`.
    block_base: Vec<u32>,
}

impl<'i> FuncCompiler<'i> {
    fn fresh(&mut self, init: Value) -> Reg {
        let r = self.next;
        self.next += 1;
        self.image.push(init);
        r
    }

    fn keyed(&mut self, key: RegKey) -> Reg {
        if let Some(&r) = self.index.get(&key) {
            return r;
        }
        let r = self.next;
        self.next += 1;
        self.image.push(Value::Nil);
        self.index.insert(key, r);
        r
    }

    fn instr_key(&self, b: BlockId, i: usize) -> RegKey {
        RegKey::Instr(self.block_base[b] + i as u32)
    }

    fn reg_of(&mut self, op: &Operand) -> EvalResult<Reg> {
        Ok(match op {
            Operand::Local(i) => self.keyed(RegKey::Local(*i)),
            Operand::Param(i) => self.keyed(RegKey::Param(*i)),
            Operand::FreeVar(i) => self.keyed(RegKey::FreeVar(*i)),
            Operand::Instr(b, i) => self.keyed(self.instr_key(*b, *i)),
            Operand::Const(c) => {
                let v = const_value(c);
                self.fresh(v)
            }
            Operand::Global(g) => {
                let prog = self.interp.program();
                let gl = prog.global(*g);
                let cell = self.interp.global_cell(*g).ok_or_else(|| {
                    Panic::plain(format!("not found global {}.{}", gl.pkg_path, gl.name))
                })?;
                let p = Value::Pointer(Pointer::cell(gl.ty.clone(), cell));
                self.fresh(p)
            }
            Operand::Func(f) => self.fresh(Value::Func(FuncValue::Compiled(*f))),
            Operand::Builtin(b) => self.fresh(Value::Func(FuncValue::Builtin(*b))),
        })
    }

    fn dst_of(&mut self, b: BlockId, i: usize) -> Reg {
        self.keyed(self.instr_key(b, i))
    }

    fn lower_call(&mut self, call: &CallCommon) -> EvalResult<Option<CompiledCall>> {
        let mut args = Vec::with_capacity(call.args.len());
        for a in &call.args {
            args.push(self.reg_of(a)?);
        }
        if let Some(method) = &call.method {
            let recv = self.reg_of(&call.func)?;
            return Ok(Some(CompiledCall {
                target: CallTarget::Invoke { recv, method: method.clone() },
                args,
            }));
        }
        let target = match &call.func {
            Operand::Func(fid) => {
                let prog = self.interp.program();
                let f = prog.func(*fid);
                if f.has_body() {
                    CallTarget::Compiled(*fid)
                } else if let Some(ext) = self.interp.find_extern(*fid) {
                    CallTarget::Native(ext)
                } else if f.name == "init" && f.params.is_empty() {
                    // A bodiless init is a silent no-op.
                    return Ok(None);
                } else {
                    return Err(Panic::runtime(format!(
                        "no code for function: {}",
                        f.qualified_name()
                    )));
                }
            }
            Operand::Builtin(b) => CallTarget::Builtin(*b),
            other => CallTarget::Dynamic(self.reg_of(other)?),
        };
        Ok(Some(CompiledCall { target, args }))
    }

    fn lower_instr(&mut self, b: BlockId, i: usize, instr: &Instr) -> EvalResult<Option<Exec>> {
        let ex = match instr {
            Instr::Alloc { ty, heap, local } => {
                if *heap {
                    Exec::AllocHeap { dst: self.dst_of(b, i), ty: ty.clone() }
                } else {
                    let slot = self.keyed(RegKey::Local(
                        local.expect("stack alloc names its local"),
                    ));
                    Exec::AllocLocal { slot, ty: ty.clone() }
                }
            }
            Instr::Phi { edges } => {
                let dst = self.dst_of(b, i);
                let mut regs = Vec::with_capacity(edges.len());
                for e in edges {
                    regs.push(self.reg_of(e)?);
                }
                Exec::Phi { dst, edges: regs }
            }
            Instr::Call { call } => match self.lower_call(call)? {
                Some(c) => Exec::Call { dst: self.dst_of(b, i), call: c },
                None => return Ok(None),
            },
            Instr::BinOp { op, x, y } => {
                let (rx, ry) = (self.reg_of(x)?, self.reg_of(y)?);
                let dst = self.dst_of(b, i);
                match op {
                    BinOp::Add => Exec::IntAdd { dst, x: rx, y: ry },
                    BinOp::Sub => Exec::IntSub { dst, x: rx, y: ry },
                    BinOp::Mul => Exec::IntMul { dst, x: rx, y: ry },
                    BinOp::Lss => Exec::IntLss { dst, x: rx, y: ry },
                    _ => Exec::Bin {
                        op: *op,
                        dst,
                        x: rx,
                        y: ry,
                        x_nil: x.is_nil_const(),
                        y_nil: y.is_nil_const(),
                    },
                }
            }
            Instr::UnOp { op, x, comma_ok } => Exec::Un {
                op: *op,
                dst: self.dst_of(b, i),
                x: self.reg_of(x)?,
                comma_ok: *comma_ok,
            },
            Instr::ChangeType { ty, x } => Exec::ChangeType {
                dst: self.dst_of(b, i),
                ty: ty.clone(),
                x: self.reg_of(x)?,
            },
            Instr::Convert { ty, x } => Exec::Convert {
                dst: self.dst_of(b, i),
                ty: ty.clone(),
                x: self.reg_of(x)?,
            },
            Instr::ChangeInterface { x } => Exec::ChangeIface {
                dst: self.dst_of(b, i),
                x: self.reg_of(x)?,
            },
            Instr::SliceToArrayPointer { ty, x } => {
                let arr_ty = ty.elem().ok_or_else(|| {
                    Panic::plain(format!("slice to array pointer of non-pointer {}", ty))
                })?;
                let arr_len = match arr_ty.underlying().kind() {
                    TypeKind::Array(_, n) => *n,
                    _ => return Err(Panic::plain(format!("not an array type: {}", arr_ty))),
                };
                Exec::SliceToArrayPointer {
                    dst: self.dst_of(b, i),
                    arr_ty,
                    arr_len,
                    x: self.reg_of(x)?,
                }
            }
            Instr::MakeInterface { ty: _, x, x_ty } => Exec::MakeIface {
                dst: self.dst_of(b, i),
                rt: self.interp.rtype_of(x_ty),
                x: self.reg_of(x)?,
            },
            Instr::MakeClosure { func, bindings } => {
                let dst = self.dst_of(b, i);
                let mut regs = Vec::with_capacity(bindings.len());
                for bi in bindings {
                    regs.push(self.reg_of(bi)?);
                }
                Exec::MakeClosure { dst, func: *func, bindings: regs }
            }
            Instr::MakeMap { ty, reserve } => {
                let (key_ty, val_ty) = match ty.underlying().kind() {
                    TypeKind::Map(k, v) => (k.clone(), v.clone()),
                    _ => return Err(Panic::plain(format!("make of non-map {}", ty))),
                };
                let underscore = key_ty
                    .struct_fields()
                    .map(|fs| fs.iter().any(|f| f.is_blank()))
                    .unwrap_or(false);
                let reserve = match reserve {
                    Some(r) => Some(self.reg_of(r)?),
                    None => None,
                };
                Exec::MakeMap {
                    dst: self.dst_of(b, i),
                    key_ty,
                    val_ty,
                    underscore,
                    reserve,
                }
            }
            Instr::MakeChan { ty, size } => {
                let elem = ty.elem().ok_or_else(|| {
                    Panic::plain(format!("make of non-channel {}", ty))
                })?;
                Exec::MakeChan { dst: self.dst_of(b, i), elem, size: self.reg_of(size)? }
            }
            Instr::MakeSlice { ty, len, cap } => {
                let elem = ty.elem().ok_or_else(|| {
                    Panic::plain(format!("make of non-slice {}", ty))
                })?;
                Exec::MakeSlice {
                    dst: self.dst_of(b, i),
                    elem,
                    len: self.reg_of(len)?,
                    cap: self.reg_of(cap)?,
                }
            }
            Instr::Slice { ty: _, x, low, high, max } => {
                let from_alloc = matches!(
                    x,
                    Operand::Local(_)
                ) || matches!(x, Operand::Instr(bb, ii)
                    if matches!(
                        self.interp.program().func(self.func_id).blocks[*bb].instrs[*ii],
                        Instr::Alloc { .. }
                    ));
                let lo = match low {
                    Some(o) => Some(self.reg_of(o)?),
                    None => None,
                };
                let hi = match high {
                    Some(o) => Some(self.reg_of(o)?),
                    None => None,
                };
                let mx = match max {
                    Some(o) => Some(self.reg_of(o)?),
                    None => None,
                };
                Exec::SliceOp {
                    dst: self.dst_of(b, i),
                    x: self.reg_of(x)?,
                    lo,
                    hi,
                    max: mx,
                    from_alloc,
                }
            }
            Instr::FieldAddr { x, st, field } => {
                let fields = st.struct_fields().ok_or_else(|| {
                    Panic::plain(format!("field address into non-struct {}", st))
                })?;
                Exec::FieldAddr {
                    dst: self.dst_of(b, i),
                    x: self.reg_of(x)?,
                    field: *field,
                    field_ty: fields[*field].ty.clone(),
                }
            }
            Instr::Field { x, st: _, field } => Exec::FieldVal {
                dst: self.dst_of(b, i),
                x: self.reg_of(x)?,
                field: *field,
            },
            Instr::IndexAddr { x, index } => Exec::IndexAddr {
                dst: self.dst_of(b, i),
                x: self.reg_of(x)?,
                index: self.reg_of(index)?,
            },
            Instr::Index { x, index } => Exec::IndexVal {
                dst: self.dst_of(b, i),
                x: self.reg_of(x)?,
                index: self.reg_of(index)?,
            },
            Instr::Lookup { x, x_ty, index, comma_ok } => {
                let (string_x, val_ty) = match x_ty.underlying().kind() {
                    TypeKind::String => (true, Type::uint8()),
                    TypeKind::Map(_, v) => (false, v.clone()),
                    _ => return Err(Panic::plain(format!("lookup into {}", x_ty))),
                };
                Exec::Lookup {
                    dst: self.dst_of(b, i),
                    x: self.reg_of(x)?,
                    index: self.reg_of(index)?,
                    comma_ok: *comma_ok,
                    string_x,
                    val_ty,
                }
            }
            Instr::Select { states, blocking } => {
                let dst = self.dst_of(b, i);
                let mut compiled = Vec::with_capacity(states.len());
                for st in states {
                    let send = match &st.send {
                        Some(s) => Some(self.reg_of(s)?),
                        None => None,
                    };
                    compiled.push(CompiledSel {
                        is_send: st.dir == ChanDir::SendOnly,
                        ch: self.reg_of(&st.chan)?,
                        send,
                        elem: st.elem.clone(),
                    });
                }
                Exec::SelectOp { dst, blocking: *blocking, states: compiled }
            }
            Instr::Range { x, x_ty: _ } => Exec::RangeOp {
                dst: self.dst_of(b, i),
                x: self.reg_of(x)?,
            },
            Instr::Next { iter, is_string: _ } => Exec::NextOp {
                dst: self.dst_of(b, i),
                iter: self.reg_of(iter)?,
            },
            Instr::TypeAssert { x, x_ty, asserted, comma_ok } => {
                // Materialize the asserted type's host view up front so
                // its method table exists by the time the check runs.
                self.interp.rtype_of(asserted);
                Exec::TypeAssert {
                    dst: self.dst_of(b, i),
                    x: self.reg_of(x)?,
                    x_ty: x_ty.clone(),
                    asserted: asserted.clone(),
                    comma_ok: *comma_ok,
                }
            }
            Instr::Extract { tuple, index } => Exec::Extract {
                dst: self.dst_of(b, i),
                tuple: self.reg_of(tuple)?,
                index: *index,
            },
            Instr::Jump => Exec::Jump,
            Instr::If { cond } => Exec::If { cond: self.reg_of(cond)? },
            Instr::Return { results } => match results.len() {
                0 => Exec::Return0,
                1 => Exec::Return1 { r: self.reg_of(&results[0])? },
                _ => {
                    let mut rs = Vec::with_capacity(results.len());
                    for r in results {
                        rs.push(self.reg_of(r)?);
                    }
                    Exec::ReturnN { rs }
                }
            },
            Instr::RunDefers => Exec::RunDefers,
            Instr::Panic { x } => Exec::Panic { x: self.reg_of(x)? },
            Instr::Go { call } => match self.lower_call(call)? {
                Some(c) => Exec::GoStmt { call: c },
                None => return Ok(None),
            },
            Instr::Defer { call } => match self.lower_call(call)? {
                Some(c) => Exec::DeferStmt { call: c },
                None => return Ok(None),
            },
            Instr::Send { chan, x } => Exec::Send {
                ch: self.reg_of(chan)?,
                x: self.reg_of(x)?,
            },
            Instr::Store { addr, val } => {
                // Stores through blank struct fields are dropped.
                if let Operand::Instr(bb, ii) = addr {
                    let prog = self.interp.program();
                    if let Instr::FieldAddr { st, field, .. } =
                        &prog.func(self.func_id).blocks[*bb].instrs[*ii]
                    {
                        if let Some(fs) = st.struct_fields() {
                            if fs[*field].is_blank() {
                                return Ok(None);
                            }
                        }
                    }
                }
                Exec::Store { addr: self.reg_of(addr)?, val: self.reg_of(val)? }
            }
            Instr::MapUpdate { map, key, val } => Exec::MapUpdate {
                map: self.reg_of(map)?,
                key: self.reg_of(key)?,
                val: self.reg_of(val)?,
            },
            Instr::DebugRef { name, x } => {
                Exec::DebugRef { name: name.clone(), x: self.reg_of(x)? }
            }
        };
        Ok(Some(ex))
    }
}

/// Lower one function. Called once per reachable function by the
/// loader walk.
pub(crate) fn compile_func(interp: &Interp, fid: FuncId) -> EvalResult<CompiledFunc> {
    let prog = interp.program();
    let f = prog.func(fid);

    let mut block_base = Vec::with_capacity(f.blocks.len());
    let mut n = 0u32;
    for blk in &f.blocks {
        block_base.push(n);
        n += blk.instrs.len() as u32;
    }

    let mut c = FuncCompiler {
        interp,
        func_id: fid,
        index: FxHashMap::default(),
        image: Vec::new(),
        next: 0,
        block_base,
    };

    // Locals, then parameters, then free variables, in declaration
    // order; everything else lands behind them.
    for i in 0..f.locals.len() {
        c.keyed(RegKey::Local(i));
    }
    for i in 0..f.params.len() {
        c.keyed(RegKey::Param(i));
    }
    for i in 0..f.free_vars.len() {
        c.keyed(RegKey::FreeVar(i));
    }

    let mut blocks = Vec::with_capacity(f.blocks.len());
    for (bi, blk) in f.blocks.iter().enumerate() {
        let mut instrs = Vec::with_capacity(blk.instrs.len());
        for (ii, instr) in blk.instrs.iter().enumerate() {
            if let Some(ex) = c.lower_instr(bi, ii, instr)? {
                instrs.push(ex);
            }
        }
        blocks.push(CompiledBlock {
            instrs,
            preds: blk.preds.clone(),
            succs: blk.succs.clone(),
        });
    }

    let results = f.sig.signature().map(|s| s.results).unwrap_or_default();
    Ok(CompiledFunc {
        id: fid,
        name: f.qualified_name(),
        blocks,
        entry: 0,
        recover_block: f.recover_block,
        reg_count: c.next as usize,
        image: c.image,
        local_types: f.locals.clone(),
        n_params: f.params.len(),
        n_free_vars: f.free_vars.len(),
        results,
    })
}

// ── Execution ────────────────────────────────────────────────────────

impl Exec {
    /// One step of the dispatcher loop.
    pub(crate) fn run(&self, interp: &Arc<Interp>, fr: &mut Frame) -> EvalResult<Cont> {
        match self {
            Exec::AllocHeap { dst, ty } => {
                fr.set(*dst, Value::Pointer(Pointer::cell(ty.clone(), new_cell(zero(ty)))));
            }
            Exec::AllocLocal { slot, ty } => {
                // The frame pre-created the cell; reaching the alloc
                // resets it to the zero value.
                match fr.get(*slot) {
                    Value::Pointer(p) => p.store(zero(ty)),
                    _ => fr.set(*slot, Value::Pointer(Pointer::cell(ty.clone(), new_cell(zero(ty))))),
                }
            }
            Exec::Phi { dst, edges } => {
                let b = fr.block.expect("phi inside a live block");
                let func = fr.func.clone();
                for (i, p) in func.blocks[b].preds.iter().enumerate() {
                    if fr.prev_block == Some(*p) {
                        let v = fr.get(edges[i]);
                        fr.set(*dst, v);
                        break;
                    }
                }
            }
            Exec::Call { dst, call } => {
                let v = run_call(interp, fr, call)?;
                fr.set(*dst, v);
            }
            Exec::IntAdd { dst, x, y } => {
                let v = match (fr.reg(*x), fr.reg(*y)) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
                    (a, b) => ops::binop(BinOp::Add, a, b, false, false)?,
                };
                fr.set(*dst, v);
            }
            Exec::IntSub { dst, x, y } => {
                let v = match (fr.reg(*x), fr.reg(*y)) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_sub(*b)),
                    (a, b) => ops::binop(BinOp::Sub, a, b, false, false)?,
                };
                fr.set(*dst, v);
            }
            Exec::IntMul { dst, x, y } => {
                let v = match (fr.reg(*x), fr.reg(*y)) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_mul(*b)),
                    (a, b) => ops::binop(BinOp::Mul, a, b, false, false)?,
                };
                fr.set(*dst, v);
            }
            Exec::IntLss { dst, x, y } => {
                let v = match (fr.reg(*x), fr.reg(*y)) {
                    (Value::Int(a), Value::Int(b)) => Value::Bool(a < b),
                    (a, b) => ops::binop(BinOp::Lss, a, b, false, false)?,
                };
                fr.set(*dst, v);
            }
            Exec::Bin { op, dst, x, y, x_nil, y_nil } => {
                let v = ops::binop(*op, fr.reg(*x), fr.reg(*y), *x_nil, *y_nil)?;
                fr.set(*dst, v);
            }
            Exec::Un { op, dst, x, comma_ok } => {
                let v = ops::unop(*op, fr.reg(*x), *comma_ok)?;
                fr.set(*dst, v);
            }
            Exec::ChangeType { dst, ty, x } | Exec::Convert { dst, ty, x } => {
                let v = ops::convert(fr.reg(*x), ty)?;
                fr.set(*dst, v);
            }
            Exec::ChangeIface { dst, x } => {
                let v = fr.get(*x);
                fr.set(*dst, v);
            }
            Exec::SliceToArrayPointer { dst, arr_ty, arr_len, x } => {
                let v = match fr.reg(*x) {
                    Value::Slice(s) => {
                        if *arr_len > s.len {
                            return Err(Panic::runtime(format!(
                                "cannot convert slice with length {} to pointer to array with length {}",
                                s.len, arr_len
                            )));
                        }
                        let items: Vec<Value> =
                            s.snapshot().into_iter().take(*arr_len).collect();
                        let elem = s.elem.clone();
                        Value::Pointer(Pointer::cell(
                            arr_ty.clone(),
                            new_cell(Value::Array(ArrayValue::from_vec(elem, items))),
                        ))
                    }
                    other => {
                        return Err(Panic::plain(format!(
                            "slice to array pointer of {}",
                            other.kind_name()
                        )))
                    }
                };
                fr.set(*dst, v);
            }
            Exec::MakeIface { dst, rt, x } => {
                let v = fr.get(*x);
                fr.set(*dst, Value::iface(rt.clone(), v));
            }
            Exec::MakeClosure { dst, func, bindings } => {
                let env: Vec<Value> = bindings.iter().map(|&r| fr.get(r)).collect();
                fr.set(
                    *dst,
                    Value::Func(FuncValue::Closure(Arc::new(crate::value::Closure {
                        func: *func,
                        env,
                    }))),
                );
            }
            Exec::MakeMap { dst, key_ty, val_ty, underscore, reserve } => {
                if let Some(r) = reserve {
                    // Size hint only; linear maps ignore it beyond
                    // validation.
                    fr.reg(*r).as_index()?;
                }
                fr.set(
                    *dst,
                    Value::Map(MapValue::new(key_ty.clone(), val_ty.clone(), *underscore)),
                );
            }
            Exec::MakeChan { dst, elem, size } => {
                let n = fr.reg(*size).as_index()?;
                if n < 0 || n >= MAX_MEM_LEN {
                    return Err(Panic::runtime("makechan: size out of range"));
                }
                fr.set(*dst, Value::Chan(ChanValue::new(elem.clone(), n as usize)));
            }
            Exec::MakeSlice { dst, elem, len, cap } => {
                let l = fr.reg(*len).as_index()?;
                if l < 0 || l >= MAX_MEM_LEN {
                    return Err(Panic::runtime("makeslice: len out of range"));
                }
                let c = fr.reg(*cap).as_index()?;
                if c < l || c >= MAX_MEM_LEN {
                    return Err(Panic::runtime("makeslice: cap out of range"));
                }
                fr.set(
                    *dst,
                    Value::Slice(SliceValue::with_len_cap(elem.clone(), l as usize, c as usize)),
                );
            }
            Exec::SliceOp { dst, x, lo, hi, max, from_alloc } => {
                let lov = match lo {
                    Some(r) => Some(fr.reg(*r).as_index()?),
                    None => None,
                };
                let hiv = match hi {
                    Some(r) => Some(fr.reg(*r).as_index()?),
                    None => None,
                };
                let maxv = match max {
                    Some(r) => Some(fr.reg(*r).as_index()?),
                    None => None,
                };
                let v = ops::slice_op(fr.reg(*x), lov, hiv, maxv, *from_alloc)?;
                fr.set(*dst, v);
            }
            Exec::FieldAddr { dst, x, field, field_ty } => {
                let v = match fr.reg(*x) {
                    Value::Pointer(p) => match p.raw() {
                        Value::Struct(s) => {
                            Value::Pointer(Pointer::elem_at(field_ty.clone(), s.fields, *field))
                        }
                        other => {
                            return Err(Panic::plain(format!(
                                "field address into {}",
                                other.kind_name()
                            )))
                        }
                    },
                    Value::Nil => {
                        return Err(Panic::runtime(
                            "invalid memory address or nil pointer dereference",
                        ))
                    }
                    other => {
                        return Err(Panic::plain(format!(
                            "field address into {}",
                            other.kind_name()
                        )))
                    }
                };
                fr.set(*dst, v);
            }
            Exec::FieldVal { dst, x, field } => {
                let v = match fr.reg(*x) {
                    Value::Struct(s) => clone_for_store(&s.fields.lock()[*field]),
                    Value::Pointer(p) => match p.raw() {
                        Value::Struct(s) => clone_for_store(&s.fields.lock()[*field]),
                        Value::Nil => {
                            return Err(Panic::runtime(
                                "invalid memory address or nil pointer dereference",
                            ))
                        }
                        other => {
                            return Err(Panic::plain(format!(
                                "field of {}",
                                other.kind_name()
                            )))
                        }
                    },
                    Value::Nil => {
                        return Err(Panic::runtime(
                            "invalid memory address or nil pointer dereference",
                        ))
                    }
                    other => return Err(Panic::plain(format!("field of {}", other.kind_name()))),
                };
                fr.set(*dst, v);
            }
            Exec::IndexAddr { dst, x, index } => {
                let idx = fr.reg(*index).as_index()?;
                let v = match fr.reg(*x) {
                    Value::Slice(s) => {
                        let i = ops::check_index(idx, s.len)?;
                        Value::Pointer(s.addr(i))
                    }
                    Value::Array(a) => {
                        let i = ops::check_index(idx, a.len())?;
                        Value::Pointer(Pointer::elem_at(a.elem.clone(), a.arr.clone(), i))
                    }
                    Value::Pointer(p) => match p.raw() {
                        Value::Array(a) => {
                            let i = ops::check_index(idx, a.len())?;
                            Value::Pointer(Pointer::elem_at(a.elem.clone(), a.arr.clone(), i))
                        }
                        other => {
                            return Err(Panic::plain(format!(
                                "index address into {}",
                                other.kind_name()
                            )))
                        }
                    },
                    Value::Nil => {
                        return Err(Panic::runtime(
                            "invalid memory address or nil pointer dereference",
                        ))
                    }
                    other => {
                        return Err(Panic::plain(format!(
                            "index address into {}",
                            other.kind_name()
                        )))
                    }
                };
                fr.set(*dst, v);
            }
            Exec::IndexVal { dst, x, index } => {
                let idx = fr.reg(*index).as_index()?;
                let v = match fr.reg(*x) {
                    Value::Array(a) => {
                        let i = ops::check_index(idx, a.len())?;
                        clone_for_store(&a.arr.lock()[i])
                    }
                    Value::Slice(s) => {
                        let i = ops::check_index(idx, s.len)?;
                        s.get(i)
                    }
                    Value::Str(s) => {
                        let i = ops::check_index(idx, s.len())?;
                        Value::Uint8(s.as_bytes()[i])
                    }
                    other => return Err(Panic::plain(format!("index of {}", other.kind_name()))),
                };
                fr.set(*dst, v);
            }
            Exec::Lookup { dst, x, index, comma_ok, string_x, val_ty } => {
                let v = if *string_x {
                    match fr.reg(*x) {
                        Value::Str(s) => {
                            let i = fr.reg(*index).as_index()?;
                            let i = ops::check_index(i, s.len())?;
                            Value::Uint8(s.as_bytes()[i])
                        }
                        other => {
                            return Err(Panic::plain(format!("lookup in {}", other.kind_name())))
                        }
                    }
                } else {
                    let key = fr.get(*index);
                    let found = match fr.reg(*x) {
                        Value::Map(m) => m.get(&key)?,
                        Value::Nil => None,
                        other => {
                            return Err(Panic::plain(format!("lookup in {}", other.kind_name())))
                        }
                    };
                    let ok = found.is_some();
                    let rv = found.unwrap_or_else(|| zero(val_ty));
                    if *comma_ok {
                        Value::tuple(vec![rv, Value::Bool(ok)])
                    } else {
                        rv
                    }
                };
                fr.set(*dst, v);
            }
            Exec::SelectOp { dst, blocking, states } => {
                let v = run_select(fr, states, *blocking)?;
                fr.set(*dst, v);
            }
            Exec::RangeOp { dst, x } => {
                let v = match fr.reg(*x) {
                    Value::Str(s) => Value::Iter(IterValue::Str(Arc::new(
                        parking_lot::Mutex::new(StrIter::new(s.clone())),
                    ))),
                    Value::Map(m) => Value::Iter(IterValue::Map(Arc::new(
                        parking_lot::Mutex::new(MapIter::new(m.snapshot())),
                    ))),
                    Value::Nil => Value::Iter(IterValue::Map(Arc::new(parking_lot::Mutex::new(
                        MapIter::new(Vec::new()),
                    )))),
                    other => return Err(Panic::plain(format!("range over {}", other.kind_name()))),
                };
                fr.set(*dst, v);
            }
            Exec::NextOp { dst, iter } => {
                let v = match fr.reg(*iter) {
                    Value::Iter(IterValue::Str(it)) => {
                        let (ok, idx, r) = it.lock().next();
                        if ok {
                            Value::tuple(vec![Value::Bool(true), Value::Int(idx), Value::Int32(r)])
                        } else {
                            Value::tuple(vec![Value::Bool(false), Value::Nil, Value::Nil])
                        }
                    }
                    Value::Iter(IterValue::Map(it)) => {
                        let (ok, k, v) = it.lock().next();
                        Value::tuple(vec![Value::Bool(ok), k, v])
                    }
                    other => return Err(Panic::plain(format!("next on {}", other.kind_name()))),
                };
                fr.set(*dst, v);
            }
            Exec::TypeAssert { dst, x, x_ty, asserted, comma_ok } => {
                let v = ops::type_assert(fr.reg(*x), x_ty, asserted, *comma_ok)?;
                fr.set(*dst, v);
            }
            Exec::Extract { dst, tuple, index } => {
                let v = match fr.reg(*tuple) {
                    Value::Tuple(vs) => vs[*index].clone(),
                    other => {
                        return Err(Panic::plain(format!(
                            "extract from non-tuple {}",
                            other.kind_name()
                        )))
                    }
                };
                fr.set(*dst, v);
            }
            Exec::Jump => {
                let b = fr.block.expect("jump inside a live block");
                fr.prev_block = fr.block;
                fr.block = Some(fr.func.blocks[b].succs[0]);
                return Ok(Cont::Jump);
            }
            Exec::If { cond } => {
                let b = fr.block.expect("branch inside a live block");
                let succ = match fr.reg(*cond) {
                    Value::Bool(true) => 0,
                    Value::Bool(false) => 1,
                    other => {
                        return Err(Panic::plain(format!(
                            "branch on non-bool {}",
                            other.kind_name()
                        )))
                    }
                };
                fr.prev_block = fr.block;
                fr.block = Some(fr.func.blocks[b].succs[succ]);
                return Ok(Cont::Jump);
            }
            Exec::Return0 => {
                fr.result = Value::Nil;
                fr.block = None;
                return Ok(Cont::Return);
            }
            Exec::Return1 { r } => {
                fr.result = fr.get(*r);
                fr.block = None;
                return Ok(Cont::Return);
            }
            Exec::ReturnN { rs } => {
                let vs: Vec<Value> = rs.iter().map(|&r| fr.get(r)).collect();
                fr.result = Value::tuple(vs);
                fr.block = None;
                return Ok(Cont::Return);
            }
            Exec::RunDefers => {
                interp.run_defers(fr)?;
            }
            Exec::Panic { x } => {
                return Err(Panic::Target(fr.get(*x)));
            }
            Exec::GoStmt { call } => {
                let (fn_v, args) = prepare_call(interp, fr, call)?;
                interp.spawn_goroutine(fn_v, args);
            }
            Exec::DeferStmt { call } => {
                let (fn_v, args) = prepare_call(interp, fr, call)?;
                fr.defers.push(Deferred { fn_v, args });
            }
            Exec::Send { ch, x } => {
                let v = fr.get(*x);
                match fr.reg(*ch) {
                    Value::Chan(c) => c.send(v)?,
                    Value::Nil => chan::block_forever(),
                    other => {
                        return Err(Panic::plain(format!("send on {}", other.kind_name())))
                    }
                }
            }
            Exec::Store { addr, val } => {
                let v = fr.get(*val);
                match fr.reg(*addr) {
                    Value::Pointer(p) => p.store(v),
                    Value::Nil => {
                        return Err(Panic::runtime(
                            "invalid memory address or nil pointer dereference",
                        ))
                    }
                    other => {
                        return Err(Panic::plain(format!("store through {}", other.kind_name())))
                    }
                }
            }
            Exec::MapUpdate { map, key, val } => {
                let k = fr.get(*key);
                let v = fr.get(*val);
                match fr.reg(*map) {
                    Value::Map(m) => m.insert(k, v)?,
                    Value::Nil => return Err(Panic::runtime("assignment to entry in nil map")),
                    other => {
                        return Err(Panic::plain(format!("map update on {}", other.kind_name())))
                    }
                }
            }
            Exec::DebugRef { name, x } => {
                let v = fr.get(*x);
                interp.debug_hook(name, &v);
            }
        }
        Ok(Cont::Next)
    }

    pub(crate) fn op_name(&self) -> &'static str {
        match self {
            Exec::AllocHeap { .. } | Exec::AllocLocal { .. } => "Alloc",
            Exec::Phi { .. } => "Phi",
            Exec::Call { .. } => "Call",
            Exec::IntAdd { .. } | Exec::IntSub { .. } | Exec::IntMul { .. }
            | Exec::IntLss { .. } | Exec::Bin { .. } => "BinOp",
            Exec::Un { .. } => "UnOp",
            Exec::ChangeType { .. } => "ChangeType",
            Exec::Convert { .. } => "Convert",
            Exec::ChangeIface { .. } => "ChangeInterface",
            Exec::SliceToArrayPointer { .. } => "SliceToArrayPointer",
            Exec::MakeIface { .. } => "MakeInterface",
            Exec::MakeClosure { .. } => "MakeClosure",
            Exec::MakeMap { .. } => "MakeMap",
            Exec::MakeChan { .. } => "MakeChan",
            Exec::MakeSlice { .. } => "MakeSlice",
            Exec::SliceOp { .. } => "Slice",
            Exec::FieldAddr { .. } => "FieldAddr",
            Exec::FieldVal { .. } => "Field",
            Exec::IndexAddr { .. } => "IndexAddr",
            Exec::IndexVal { .. } => "Index",
            Exec::Lookup { .. } => "Lookup",
            Exec::SelectOp { .. } => "Select",
            Exec::RangeOp { .. } => "Range",
            Exec::NextOp { .. } => "Next",
            Exec::TypeAssert { .. } => "TypeAssert",
            Exec::Extract { .. } => "Extract",
            Exec::Jump => "Jump",
            Exec::If { .. } => "If",
            Exec::Return0 | Exec::Return1 { .. } | Exec::ReturnN { .. } => "Return",
            Exec::RunDefers => "RunDefers",
            Exec::Panic { .. } => "Panic",
            Exec::GoStmt { .. } => "Go",
            Exec::DeferStmt { .. } => "Defer",
            Exec::Send { .. } => "Send",
            Exec::Store { .. } => "Store",
            Exec::MapUpdate { .. } => "MapUpdate",
            Exec::DebugRef { .. } => "DebugRef",
        }
    }
}

fn run_call(interp: &Arc<Interp>, fr: &mut Frame, call: &CompiledCall) -> EvalResult<Value> {
    let args: Vec<Value> = call.args.iter().map(|&r| fr.get(r)).collect();
    match &call.target {
        CallTarget::Compiled(fid) => interp.call_func_id(Some(&fr.panics), *fid, args),
        CallTarget::Native(hf) => hf.call(interp, &args),
        CallTarget::Builtin(b) => crate::builtins::call_builtin(interp, Some(&fr.panics), *b, args),
        CallTarget::Dynamic(r) => {
            let f = fr.get(*r);
            interp.call_value(Some(&fr.panics), &f, args)
        }
        CallTarget::Invoke { recv, method } => {
            let recv_v = fr.get(*recv);
            interp.invoke_method(Some(&fr.panics), &recv_v, method, args)
        }
    }
}

/// Resolve the callee and evaluate the arguments of a Go or Defer at
/// the instruction's reach, per call semantics: the deferred body runs
/// later, its operands are captured now.
fn prepare_call(
    interp: &Arc<Interp>,
    fr: &mut Frame,
    call: &CompiledCall,
) -> EvalResult<(Value, Vec<Value>)> {
    let mut args: Vec<Value> = call.args.iter().map(|&r| fr.get(r)).collect();
    let fn_v = match &call.target {
        CallTarget::Compiled(fid) => Value::Func(FuncValue::Compiled(*fid)),
        CallTarget::Native(hf) => Value::Func(FuncValue::Native(hf.clone())),
        CallTarget::Builtin(b) => Value::Func(FuncValue::Builtin(*b)),
        CallTarget::Dynamic(r) => fr.get(*r),
        CallTarget::Invoke { recv, method } => {
            let recv_v = fr.get(*recv);
            let resolved = interp.resolve_method(&recv_v, method)?;
            args.insert(0, receiver_payload(&recv_v));
            resolved
        }
    };
    Ok((fn_v, args))
}

pub(crate) fn receiver_payload(recv: &Value) -> Value {
    match recv {
        Value::Iface(i) => i.val.clone(),
        other => other.clone(),
    }
}

fn run_select(fr: &mut Frame, states: &[CompiledSel], blocking: bool) -> EvalResult<Value> {
    let mut cases = Vec::with_capacity(states.len());
    for st in states {
        let ch = match fr.get(st.ch) {
            Value::Chan(c) => Some(c),
            Value::Nil => None,
            other => return Err(Panic::plain(format!("select on {}", other.kind_name()))),
        };
        let send = match st.send {
            Some(r) => Some(fr.get(r)),
            None => None,
        };
        cases.push(SelCase {
            dir: if st.is_send { ChanDir::SendOnly } else { ChanDir::RecvOnly },
            chan: ch,
            send,
        });
    }
    let r = chan::select_cases(&cases, blocking)?;

    let mut tuple = vec![Value::Int(r.chosen), Value::Bool(r.recv_ok)];
    for (i, st) in states.iter().enumerate() {
        if st.is_send {
            continue;
        }
        if r.chosen == i as i64 && r.recv_ok {
            tuple.push(r.value.clone().unwrap_or_else(|| zero(&st.elem)));
        } else {
            tuple.push(zero(&st.elem));
        }
    }
    Ok(Value::tuple(tuple))
}
