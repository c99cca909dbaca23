//! The engine: program-wide state, frames, the dispatcher loop, the
//! unified call path, and defer/panic/recover.
//!
//! Panics travel as `Result<_, Panic>` through the dispatcher; a
//! panicking frame drains its defer chain (each deferred call under
//! its own recovery window), then either resumes at its recover block
//! or re-raises to its caller. `run`/`run_func` map the surviving
//! panic kinds to exit codes and errors at the top.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::bridge::{self, HostFunc, Loader, RtMethod, Rtype, TypesRecord};
use crate::builtins;
use crate::compile::{self, CompiledFunc, Reg};
use crate::error::{Error, EvalResult, Panic};
use crate::loader;
use crate::ssa::{BlockId, FuncId, GlobalId, Program};
use crate::types::{ChanDir, Type};
use crate::value::{clone_for_store, new_cell, zero, Cell, FuncValue, Pointer, Value};

/// What the dispatcher does after an instruction: fall through,
/// transfer to a new block, or leave the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cont {
    Next,
    Jump,
    Return,
}

/// Interpreter options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mode {
    /// Log every call entry and deferred invocation.
    pub enable_tracing: bool,
    /// Log every instruction before it executes.
    pub enable_dump_instr: bool,
    /// Leave panics unhandled so they propagate to the embedder;
    /// `recover` becomes inert.
    pub disable_recover: bool,
}

/// A named value binding surfaced to the debug sink.
#[derive(Debug)]
pub struct DebugInfo {
    pub name: String,
    pub value: Value,
}

type DebugSink = Box<dyn Fn(&DebugInfo) + Send + Sync>;

/// Per-frame panic state, chained to the caller's. `recover` walks
/// this chain: it succeeds exactly two frames below the panicking one.
pub struct PanicCell {
    state: Mutex<Option<Panic>>,
    caller: Option<Arc<PanicCell>>,
}

impl PanicCell {
    pub(crate) fn child(caller: Option<&Arc<PanicCell>>) -> Arc<PanicCell> {
        Arc::new(PanicCell { state: Mutex::new(None), caller: caller.cloned() })
    }

    pub(crate) fn set(&self, p: Panic) {
        *self.state.lock() = Some(p);
    }

    pub(crate) fn panicking(&self) -> bool {
        self.state.lock().is_some()
    }

    pub(crate) fn current(&self) -> Option<Panic> {
        self.state.lock().clone()
    }

    pub(crate) fn take(&self) -> Option<Panic> {
        self.state.lock().take()
    }

    pub(crate) fn put_back(&self, p: Panic) {
        *self.state.lock() = Some(p);
    }

    pub(crate) fn caller(&self) -> Option<&Arc<PanicCell>> {
        self.caller.as_ref()
    }
}

/// A delayed call recorded by a Defer instruction: callee and
/// arguments are captured at the defer's reach, the body runs at
/// frame exit.
pub struct Deferred {
    pub fn_v: Value,
    pub args: Vec<Value>,
}

/// The activation record of one call.
pub struct Frame {
    pub func: Arc<CompiledFunc>,
    pub regs: Vec<Value>,
    pub block: Option<BlockId>,
    pub prev_block: Option<BlockId>,
    pub defers: Vec<Deferred>,
    pub result: Value,
    pub panics: Arc<PanicCell>,
}

impl Frame {
    #[inline]
    pub(crate) fn reg(&self, r: Reg) -> &Value {
        &self.regs[r as usize]
    }

    #[inline]
    pub(crate) fn get(&self, r: Reg) -> Value {
        self.regs[r as usize].clone()
    }

    #[inline]
    pub(crate) fn set(&mut self, r: Reg, v: Value) {
        self.regs[r as usize] = v;
    }
}

/// State shared between all interpreted goroutines.
pub struct Interp {
    prog: Arc<Program>,
    main_path: String,
    loader: Arc<dyn Loader>,
    record: TypesRecord,
    globals: FxHashMap<GlobalId, Cell>,
    mode: Mode,
    goroutines: AtomicI32,
    funcs: RwLock<FxHashMap<FuncId, Arc<CompiledFunc>>>,
    debug: RwLock<Option<DebugSink>>,
}

impl Interp {
    /// Build an engine: zero-initialize globals, compile every
    /// reachable function (the static package check), then run the
    /// init chain.
    pub fn new(
        loader: Arc<dyn Loader>,
        prog: Program,
        main_path: &str,
        mode: Mode,
    ) -> Result<Arc<Interp>, Error> {
        let prog = Arc::new(prog);
        if prog.package(main_path).is_none() {
            return Err(Error::NoFunction(format!("package {}", main_path)));
        }
        let mut globals = FxHashMap::default();
        for (i, g) in prog.globals.iter().enumerate() {
            globals.insert(GlobalId(i as u32), new_cell(zero(&g.ty)));
        }
        let interp = Arc::new(Interp {
            prog,
            main_path: main_path.to_string(),
            loader,
            record: TypesRecord::new(),
            globals,
            mode,
            goroutines: AtomicI32::new(1),
            funcs: RwLock::new(FxHashMap::default()),
            debug: RwLock::new(None),
        });
        loader::check_packages(&interp)?;
        let init = interp
            .prog
            .package(main_path)
            .and_then(|p| p.funcs.get("init"))
            .copied();
        if let Some(fid) = init {
            interp
                .call_func_id(None, fid, vec![])
                .map_err(|p| Error::Init(Box::new(Error::from_panic(p))))?;
        }
        Ok(interp)
    }

    /// Run a zero-argument entry function. Exit codes: 0 normal
    /// return, 1 entry not found, 2 uncaught panic.
    pub fn run(self: &Arc<Self>, entry: &str) -> (i32, Option<Error>) {
        let fid = match self.main_func(entry) {
            Some(f) => f,
            None => return (1, Some(Error::NoFunction(entry.to_string()))),
        };
        match self.call_func_id(None, fid, vec![]) {
            Ok(_) => (0, None),
            Err(Panic::Exit(code)) => (code, None),
            Err(p) => {
                if self.mode.disable_recover {
                    panic!("{}", p);
                }
                (2, Some(Error::from_panic(p)))
            }
        }
    }

    /// Invoke a named top-level function with pre-marshalled
    /// arguments.
    pub fn run_func(self: &Arc<Self>, name: &str, args: Vec<Value>) -> Result<Value, Error> {
        let fid = match self.main_func(name) {
            Some(f) => f,
            None => return Err(Error::NoFunction(name.to_string())),
        };
        match self.call_func_id(None, fid, args) {
            Ok(v) => Ok(v),
            Err(Panic::Exit(_)) => Ok(Value::Nil),
            Err(p) => {
                if self.mode.disable_recover {
                    panic!("{}", p);
                }
                Err(Error::from_panic(p))
            }
        }
    }

    /// Call an arbitrary function value obtained from `get_func` or
    /// produced by the program.
    pub fn call(self: &Arc<Self>, f: &Value, args: Vec<Value>) -> Result<Value, Error> {
        self.call_value(None, f, args).map_err(Error::from_panic)
    }

    pub fn get_func(&self, key: &str) -> Option<Value> {
        self.main_func(key).map(|f| Value::Func(FuncValue::Compiled(f)))
    }

    pub fn get_var_addr(&self, key: &str) -> Option<Value> {
        let pkg = self.prog.package(&self.main_path)?;
        let gid = *pkg.globals.get(key)?;
        let cell = self.global_cell(gid)?;
        let ty = self.prog.global(gid).ty.clone();
        Some(Value::Pointer(Pointer::cell(ty, cell)))
    }

    pub fn get_const(&self, key: &str) -> Option<Value> {
        let pkg = self.prog.package(&self.main_path)?;
        pkg.consts.get(key).map(|c| compile::const_value(c))
    }

    pub fn get_type(&self, key: &str) -> Option<Rtype> {
        let pkg = self.prog.package(&self.main_path)?;
        pkg.types.get(key).map(|t| self.rtype_of(t))
    }

    /// Install a per-instruction debug hook fed by DebugRef
    /// instructions.
    pub fn set_debug<F>(&self, sink: F)
    where
        F: Fn(&DebugInfo) + Send + Sync + 'static,
    {
        *self.debug.write() = Some(Box::new(sink));
    }

    /// The live goroutine count, main included.
    pub fn goroutines(&self) -> i32 {
        self.goroutines.load(Ordering::SeqCst)
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn program(&self) -> &Program {
        &self.prog
    }

    fn main_func(&self, name: &str) -> Option<FuncId> {
        self.prog.package(&self.main_path)?.funcs.get(name).copied()
    }

    pub(crate) fn debug_hook(&self, name: &str, value: &Value) {
        if let Some(sink) = self.debug.read().as_ref() {
            sink(&DebugInfo { name: name.to_string(), value: value.clone() });
        }
    }

    /// The storage cell of a global: a registered package variable
    /// shadows interpreter storage.
    pub(crate) fn global_cell(&self, gid: GlobalId) -> Option<Cell> {
        let g = self.prog.global(gid);
        if let Some(pkg) = self.loader.installed(&g.pkg_path) {
            if let Some(cell) = pkg.vars.get(&g.name) {
                return Some(cell.clone());
            }
        }
        self.globals.get(&gid).cloned()
    }

    /// Resolve a bodiless function to a registered native: a package
    /// function by bare name, or a native method of the receiver's
    /// host type.
    pub(crate) fn find_extern(&self, fid: FuncId) -> Option<Arc<HostFunc>> {
        let f = self.prog.func(fid);
        if let Some(recv) = &f.recv {
            return self.loader.lookup_reflect(recv)?.method_by_name(&f.name);
        }
        self.loader.installed(&f.pkg_path)?.funcs.get(&f.name).cloned()
    }

    /// The host view of a type. Interpreted named types (and pointers
    /// to them) materialize a method table of trampolines that
    /// re-enter the engine.
    pub(crate) fn rtype_of(&self, ty: &Type) -> Rtype {
        self.record.to_rtype(ty, |t| {
            if let Some(rt) = self.loader.lookup_reflect(t) {
                return rt;
            }
            // A pointer receiver sees the pointee's method set.
            let base = match t.kind() {
                crate::types::TypeKind::Pointer(e) if e.is_named() => e.clone(),
                _ => t.clone(),
            };
            let rt = Rtype::new(t.clone(), base.is_named());
            for m in base.declared_methods() {
                if let Some(fid) = self.prog.lookup_method(&base, &m.name) {
                    let name = m.name.clone();
                    let tramp = HostFunc::new(
                        name.clone(),
                        vec![],
                        false,
                        move |i: &Arc<Interp>, args: &[Value]| {
                            i.call_func_id(None, fid, args.to_vec())
                        },
                    );
                    rt.add_method(RtMethod { name, func: tramp });
                }
            }
            rt
        })
    }

    /// Best-effort dynamic type of a bare (unboxed) value.
    fn rtype_of_value(&self, v: &Value) -> Option<Rtype> {
        let ty = match v {
            Value::Iface(i) => return Some(i.rtype.clone()),
            Value::Struct(s) => s.ty.clone(),
            Value::Pointer(p) => {
                if p.elem.is_named() {
                    p.elem.clone()
                } else {
                    Type::pointer(p.elem.clone())
                }
            }
            Value::Slice(s) => Type::slice(s.elem.clone()),
            Value::Map(m) => Type::map(m.key_ty.clone(), m.val_ty.clone()),
            Value::Chan(c) => Type::chan(ChanDir::Both, c.elem()),
            Value::Str(_) => Type::string(),
            Value::Bool(_) => Type::bool(),
            Value::Int(_) => Type::int(),
            Value::Int8(_) => Type::int8(),
            Value::Int16(_) => Type::int16(),
            Value::Int32(_) => Type::int32(),
            Value::Int64(_) => Type::int64(),
            Value::Uint(_) => Type::uint(),
            Value::Uint8(_) => Type::uint8(),
            Value::Uint16(_) => Type::uint16(),
            Value::Uint32(_) => Type::uint32(),
            Value::Uint64(_) => Type::uint64(),
            Value::Uintptr(_) => Type::uintptr(),
            Value::Float32(_) => Type::float32(),
            Value::Float64(_) => Type::float64(),
            Value::Complex64(..) => Type::complex64(),
            Value::Complex128(..) => Type::complex128(),
            _ => return None,
        };
        Some(self.rtype_of(&ty))
    }

    fn compiled(&self, fid: FuncId) -> Option<Arc<CompiledFunc>> {
        self.funcs.read().get(&fid).cloned()
    }

    pub(crate) fn install_compiled(&self, pfn: CompiledFunc) -> Arc<CompiledFunc> {
        let pfn = Arc::new(pfn);
        self.funcs.write().insert(pfn.id, pfn.clone());
        pfn
    }

    /// Dispatch a call on the callee's shape.
    pub(crate) fn call_value(
        self: &Arc<Self>,
        caller: Option<&Arc<PanicCell>>,
        f: &Value,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        match f {
            Value::Func(FuncValue::Compiled(fid)) => self.call_func_id(caller, *fid, args),
            Value::Func(FuncValue::Closure(c)) => match self.compiled(c.func) {
                Some(pfn) => self.call_compiled(caller, &pfn, args, &c.env),
                None => Err(Panic::runtime(format!(
                    "no code for function: {}",
                    self.prog.func(c.func).qualified_name()
                ))),
            },
            Value::Func(FuncValue::Native(hf)) => hf.call(self, &args),
            Value::Func(FuncValue::Builtin(b)) => builtins::call_builtin(self, caller, *b, args),
            Value::Iface(i) => self.call_value(caller, &i.val, args),
            Value::Nil => Err(Panic::plain("call of nil function")),
            other => Err(Panic::plain(format!("cannot call {}", other.kind_name()))),
        }
    }

    /// Call a program function by id. Bodiless functions route through
    /// the bridge: a registered extern, a native method of the
    /// receiver's host type, or a fabricated-method fallback by name.
    pub(crate) fn call_func_id(
        self: &Arc<Self>,
        caller: Option<&Arc<PanicCell>>,
        fid: FuncId,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        if let Some(pfn) = self.compiled(fid) {
            return self.call_compiled(caller, &pfn, args, &[]);
        }
        let f = self.prog.func(fid);
        if f.has_body() {
            let pfn = self.install_compiled(compile::compile_func(self, fid)?);
            return self.call_compiled(caller, &pfn, args, &[]);
        }
        if let Some(ext) = self.find_extern(fid) {
            if self.mode.enable_tracing {
                trace!(target: "sago", "calling external {}", f.qualified_name());
            }
            return ext.call(self, &args);
        }
        if f.recv.is_some() && !args.is_empty() {
            if let Some(rt) = self.rtype_of_value(&args[0]) {
                if let Some(m) = rt.method_by_name(&f.name) {
                    return m.call(self, &args);
                }
            }
        }
        if f.name == "init" && f.params.is_empty() {
            return Ok(Value::Nil);
        }
        Err(Panic::runtime(format!("no code for function: {}", f.qualified_name())))
    }

    /// Resolve an interface method against the receiver's dynamic
    /// type: interpreted body, `reflect.Type` helper, or the host
    /// method table.
    pub(crate) fn resolve_method(&self, recv: &Value, method: &str) -> EvalResult<Value> {
        let inner = match recv {
            Value::Iface(i) => &i.val,
            other => other,
        };
        if matches!(inner, Value::Rtype(_)) {
            if let Some(h) = bridge::reflect_method_helper(method) {
                return Ok(Value::Func(FuncValue::Native(h)));
            }
        }
        let rt = match recv {
            Value::Iface(i) => i.rtype.clone(),
            Value::Nil => {
                return Err(Panic::runtime("invalid memory address or nil pointer dereference"))
            }
            other => self.rtype_of_value(other).ok_or_else(|| {
                Panic::plain(format!("method {} on {}", method, other.kind_name()))
            })?,
        };
        if let Some((name, path)) = rt.ty().name_and_path() {
            if name == "Type" && path == "reflect" {
                if let Some(h) = bridge::reflect_method_helper(method) {
                    return Ok(Value::Func(FuncValue::Native(h)));
                }
            }
        }
        if let Some(local) = self.record.lookup_local(&rt) {
            if let Some(f) = self.prog.lookup_method(&local, method) {
                return Ok(Value::Func(FuncValue::Compiled(f)));
            }
            if rt.method_by_name(method).is_none() {
                // Unreachable in well-typed programs.
                return Err(Panic::plain(format!(
                    "method set for dynamic type {} does not contain {}",
                    local, method
                )));
            }
        }
        match rt.method_by_name(method) {
            Some(m) => Ok(Value::Func(FuncValue::Native(m))),
            None => Err(Panic::runtime("invalid memory address or nil pointer dereference")),
        }
    }

    pub(crate) fn invoke_method(
        self: &Arc<Self>,
        caller: Option<&Arc<PanicCell>>,
        recv: &Value,
        method: &str,
        mut args: Vec<Value>,
    ) -> EvalResult<Value> {
        let fn_v = self.resolve_method(recv, method)?;
        args.insert(0, compile::receiver_payload(recv));
        self.call_value(caller, &fn_v, args)
    }

    /// Run an interpreted function: copy the register image, place
    /// locals/parameters/free variables, and drive the dispatcher,
    /// handling panic recovery at this frame.
    pub(crate) fn call_compiled(
        self: &Arc<Self>,
        caller: Option<&Arc<PanicCell>>,
        pfn: &Arc<CompiledFunc>,
        args: Vec<Value>,
        env: &[Value],
    ) -> EvalResult<Value> {
        if self.mode.enable_tracing {
            trace!(target: "sago", "entering {}", pfn.name);
        }
        let mut fr = Frame {
            func: pfn.clone(),
            regs: pfn.image.clone(),
            block: Some(pfn.entry),
            prev_block: None,
            defers: Vec::new(),
            result: Value::Nil,
            panics: PanicCell::child(caller),
        };
        let nl = pfn.local_types.len();
        for (i, lt) in pfn.local_types.iter().enumerate() {
            fr.regs[i] = Value::Pointer(Pointer::cell(lt.clone(), new_cell(zero(lt))));
        }
        for (i, a) in args.into_iter().enumerate() {
            if i < pfn.n_params {
                fr.regs[nl + i] = clone_for_store(&a);
            }
        }
        for (i, e) in env.iter().enumerate().take(pfn.n_free_vars) {
            fr.regs[nl + pfn.n_params + i] = e.clone();
        }

        loop {
            match self.run_frame(&mut fr) {
                Ok(()) => break,
                Err(p) => {
                    if self.mode.disable_recover {
                        return Err(p);
                    }
                    if self.mode.enable_tracing {
                        trace!(target: "sago", "panicking in {}: {}", pfn.name, p);
                    }
                    fr.panics.set(p);
                    self.run_defers(&mut fr)?;
                    // A deferred call recovered: resume at the recover
                    // block, or return zero results without one.
                    match pfn.recover_block {
                        Some(rb) => {
                            fr.block = Some(rb);
                            continue;
                        }
                        None => {
                            fr.result = zero_results(pfn);
                            break;
                        }
                    }
                }
            }
        }
        if self.mode.enable_tracing {
            trace!(target: "sago", "leaving {}", pfn.name);
        }
        Ok(fr.result)
    }

    /// The dispatcher: block-by-block execution driven by
    /// continuation codes.
    fn run_frame(self: &Arc<Self>, fr: &mut Frame) -> EvalResult<()> {
        let func = fr.func.clone();
        while let Some(b) = fr.block {
            let mut jumped = false;
            for ex in &func.blocks[b].instrs {
                if self.mode.enable_dump_instr {
                    trace!(target: "sago", "\t{:<20} {:?}", ex.op_name(), ex);
                }
                match ex.run(self, fr)? {
                    Cont::Next => {}
                    Cont::Jump => {
                        jumped = true;
                        break;
                    }
                    Cont::Return => return Ok(()),
                }
            }
            if !jumped {
                panic!("function {}: block {} has no terminator", func.name, b);
            }
        }
        Ok(())
    }

    /// Drain the defer chain in LIFO order. Each deferred call runs
    /// under its own recovery window: a new panic replaces the frame's
    /// panic state, a recover clears it. Re-raises if a panic is still
    /// pending afterwards.
    pub(crate) fn run_defers(self: &Arc<Self>, fr: &mut Frame) -> EvalResult<()> {
        while let Some(d) = fr.defers.pop() {
            if self.mode.enable_tracing {
                trace!(target: "sago", "invoking deferred call in {}", fr.func.name);
            }
            if let Err(p) = self.call_value(Some(&fr.panics), &d.fn_v, d.args) {
                fr.panics.set(p);
            }
        }
        match fr.panics.current() {
            Some(p) => Err(p),
            None => Ok(()),
        }
    }

    pub(crate) fn spawn_goroutine(self: &Arc<Self>, fn_v: Value, args: Vec<Value>) {
        self.goroutines.fetch_add(1, Ordering::SeqCst);
        let interp = self.clone();
        std::thread::spawn(move || {
            if interp.mode.enable_tracing {
                trace!(target: "sago", "goroutine started");
            }
            match interp.call_value(None, &fn_v, args) {
                Ok(_) => {}
                Err(Panic::Exit(code)) => std::process::exit(code),
                Err(p) => {
                    // An unrecovered panic in any goroutine crashes
                    // the program, like the source runtime.
                    eprintln!("panic: {}", p);
                    std::process::exit(2);
                }
            }
            interp.goroutines.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

fn zero_results(pfn: &CompiledFunc) -> Value {
    match pfn.results.len() {
        0 => Value::Nil,
        1 => zero(&pfn.results[0]),
        _ => Value::tuple(pfn.results.iter().map(zero).collect()),
    }
}
