//! The reachability walk: compile every function the program can
//! reach and surface bodiless interpreted functions as construction
//! errors.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::compile;
use crate::error::{Error, PlainError};
use crate::interp::Interp;
use crate::ssa::{CallCommon, FuncId, Function, Instr, Operand};

pub(crate) fn check_packages(interp: &Arc<Interp>) -> Result<(), Error> {
    let prog = interp.program();
    let mut pending: Vec<FuncId> = Vec::new();
    for pkg in &prog.pkgs {
        pending.extend(pkg.funcs.values().copied());
    }
    pending.extend(prog.method_funcs());

    let mut seen: FxHashSet<FuncId> = FxHashSet::default();
    while let Some(fid) = pending.pop() {
        if !seen.insert(fid) {
            continue;
        }
        let f = prog.func(fid);
        if !f.has_body() {
            // Bodiless declarations must resolve through the bridge;
            // a bare init is a silent no-op.
            if interp.find_extern(fid).is_some() || (f.name == "init" && f.params.is_empty()) {
                continue;
            }
            return Err(Error::Plain(PlainError(format!(
                "missing function body: {}",
                f.qualified_name()
            ))));
        }
        let pfn = compile::compile_func(interp, fid)
            .map_err(|p| Error::Plain(PlainError(p.to_string())))?;
        interp.install_compiled(pfn);
        collect_refs(f, &mut pending);
    }
    Ok(())
}

fn push_op(o: &Operand, out: &mut Vec<FuncId>) {
    if let Operand::Func(fid) = o {
        out.push(*fid);
    }
}

fn push_call(c: &CallCommon, out: &mut Vec<FuncId>) {
    push_op(&c.func, out);
    for a in &c.args {
        push_op(a, out);
    }
}

fn collect_refs(f: &Function, out: &mut Vec<FuncId>) {
    for b in &f.blocks {
        for i in &b.instrs {
            match i {
                Instr::Call { call } | Instr::Go { call } | Instr::Defer { call } => {
                    push_call(call, out)
                }
                Instr::MakeClosure { func, bindings } => {
                    out.push(*func);
                    for bi in bindings {
                        push_op(bi, out);
                    }
                }
                Instr::Phi { edges } => {
                    for e in edges {
                        push_op(e, out);
                    }
                }
                Instr::BinOp { x, y, .. } => {
                    push_op(x, out);
                    push_op(y, out);
                }
                Instr::UnOp { x, .. }
                | Instr::ChangeType { x, .. }
                | Instr::Convert { x, .. }
                | Instr::ChangeInterface { x }
                | Instr::SliceToArrayPointer { x, .. }
                | Instr::MakeInterface { x, .. }
                | Instr::FieldAddr { x, .. }
                | Instr::Field { x, .. }
                | Instr::Range { x, .. }
                | Instr::Panic { x }
                | Instr::TypeAssert { x, .. }
                | Instr::DebugRef { x, .. } => push_op(x, out),
                Instr::IndexAddr { x, index } | Instr::Index { x, index } => {
                    push_op(x, out);
                    push_op(index, out);
                }
                Instr::Lookup { x, index, .. } => {
                    push_op(x, out);
                    push_op(index, out);
                }
                Instr::Slice { x, low, high, max, .. } => {
                    push_op(x, out);
                    if let Some(o) = low {
                        push_op(o, out);
                    }
                    if let Some(o) = high {
                        push_op(o, out);
                    }
                    if let Some(o) = max {
                        push_op(o, out);
                    }
                }
                Instr::Select { states, .. } => {
                    for st in states {
                        push_op(&st.chan, out);
                        if let Some(s) = &st.send {
                            push_op(s, out);
                        }
                    }
                }
                Instr::MakeMap { reserve, .. } => {
                    if let Some(r) = reserve {
                        push_op(r, out);
                    }
                }
                Instr::MakeChan { size, .. } => push_op(size, out),
                Instr::MakeSlice { len, cap, .. } => {
                    push_op(len, out);
                    push_op(cap, out);
                }
                Instr::Extract { tuple, .. } => push_op(tuple, out),
                Instr::Next { iter, .. } => push_op(iter, out),
                Instr::If { cond } => push_op(cond, out),
                Instr::Return { results } => {
                    for r in results {
                        push_op(r, out);
                    }
                }
                Instr::Send { chan, x } => {
                    push_op(chan, out);
                    push_op(x, out);
                }
                Instr::Store { addr, val } => {
                    push_op(addr, out);
                    push_op(val, out);
                }
                Instr::MapUpdate { map, key, val } => {
                    push_op(map, out);
                    push_op(key, out);
                    push_op(val, out);
                }
                Instr::Alloc { .. } | Instr::Jump | Instr::RunDefers => {}
            }
        }
    }
}
