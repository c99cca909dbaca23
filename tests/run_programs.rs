//! End-to-end programs driven through the embedding API: hand-built
//! SSA, a registered native package or two, and assertions on exit
//! codes, captured output, and observable state.

use std::sync::{Arc, Mutex};

use sago::ssa::{
    BinOp, Builtin, CallCommon, Const, Instr, Operand, Program, SelState, UnOp,
};
use sago::types::{ChanDir, Field, MethodSig, Type};
use sago::value::Value;
use sago::{HostFunc, Interp, Mode, Package, Registry};

/// Output capture is process-wide; capture-using tests take this lock.
static CAP: Mutex<()> = Mutex::new(());

fn with_capture<T>(f: impl FnOnce() -> T) -> (T, String) {
    let _g = CAP.lock().unwrap_or_else(|e| e.into_inner());
    sago::capture_output(true);
    let r = f();
    let out = String::from_utf8_lossy(&sago::take_captured()).into_owned();
    sago::capture_output(false);
    (r, out)
}

fn any() -> Type {
    Type::interface(vec![])
}

/// A registry holding a minimal fmt package whose Println joins its
/// arguments and writes through the output shim.
fn fmt_registry() -> Arc<Registry> {
    let reg = Registry::new();
    let mut fmt = Package::new("fmt", "fmt");
    fmt.add_func(HostFunc::new("Println", vec![], true, |_, args| {
        let line = args
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        sago::write_output(format!("{}\n", line).as_bytes());
        Ok(Value::Nil)
    }));
    reg.register(fmt);
    Arc::new(reg)
}

/// Declare a bodiless fmt.Println in the program so calls resolve
/// through the registry.
fn declare_fmt(prog: &mut Program) -> sago::ssa::FuncId {
    let fmt = prog.add_package("fmt", "fmt");
    prog.add_func(
        fmt,
        "Println",
        Type::func(vec![Type::slice(any())], vec![], true),
    )
}

// --- Scenario: arithmetic through a native package ---

#[test]
fn println_sum_writes_three() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let println = declare_fmt(&mut prog);
    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));

    let f = prog.func_mut(main_fn);
    let b0 = f.add_block();
    let sum = f.push(
        b0,
        Instr::BinOp {
            op: BinOp::Add,
            x: Operand::konst(Const::int(1)),
            y: Operand::konst(Const::int(2)),
        },
    );
    let boxed = f.push(
        b0,
        Instr::MakeInterface { ty: any(), x: sum, x_ty: Type::int() },
    );
    f.push(
        b0,
        Instr::Call { call: CallCommon::call(Operand::Func(println), vec![boxed]) },
    );
    f.push(b0, Instr::Return { results: vec![] });
    prog.seal();

    let ((code, err), out) = with_capture(|| {
        let interp = Interp::new(fmt_registry(), prog, "main", Mode::default()).unwrap();
        interp.run("main")
    });
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    assert_eq!(out, "3\n");
}

// --- Scenario: defers drain in LIFO order, then the panic surfaces ---

#[test]
fn deferred_prints_run_backwards_before_panic() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));

    let f = prog.func_mut(main_fn);
    let b0 = f.add_block();
    for label in ["A", "B", "C"] {
        f.push(
            b0,
            Instr::Defer {
                call: CallCommon::call(
                    Operand::Builtin(Builtin::Println),
                    vec![Operand::konst(Const::str(label))],
                ),
            },
        );
    }
    f.push(b0, Instr::Panic { x: Operand::konst(Const::str("boom")) });
    prog.seal();

    let ((code, err), out) = with_capture(|| {
        let interp =
            Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
        interp.run("main")
    });
    assert_eq!(code, 2);
    assert_eq!(err.expect("panic must surface").to_string(), "boom");
    assert_eq!(out, "C\nB\nA\n");
}

// --- Scenario: 100 goroutines over a buffered channel ---

#[test]
fn hundred_goroutines_sum_indexes() {
    let chan_ty = Type::chan(ChanDir::Both, Type::int());
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let total = prog.add_global(main_pkg, "total", Type::int());

    let sender = prog.add_func(
        main_pkg,
        "sender",
        Type::func(vec![chan_ty.clone(), Type::int()], vec![], false),
    );
    {
        let f = prog.func_mut(sender);
        let ch = f.add_param("ch", chan_ty.clone());
        let ix = f.add_param("ix", Type::int());
        let b0 = f.add_block();
        f.push(b0, Instr::Send { chan: ch, x: ix });
        f.push(b0, Instr::Return { results: vec![] });
    }

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();
        let b4 = f.add_block();
        let b5 = f.add_block();

        // b0: ch = make(chan int, 100)
        let ch = f.push(
            b0,
            Instr::MakeChan { ty: chan_ty.clone(), size: Operand::konst(Const::int(100)) },
        );
        f.push(b0, Instr::Jump);
        f.set_succs(b0, &[b1]);

        // b1: i = phi(0, i2); if i < 100 goto b2 else b3
        let i = f.push(
            b1,
            Instr::Phi {
                edges: vec![Operand::konst(Const::int(0)), Operand::Instr(b2, 1)],
            },
        );
        let cond = f.push(
            b1,
            Instr::BinOp { op: BinOp::Lss, x: i.clone(), y: Operand::konst(Const::int(100)) },
        );
        f.push(b1, Instr::If { cond });
        f.set_succs(b1, &[b2, b3]);

        // b2: go sender(ch, i); i2 = i + 1
        f.push(
            b2,
            Instr::Go {
                call: CallCommon::call(Operand::Func(sender), vec![ch.clone(), i.clone()]),
            },
        );
        f.push(
            b2,
            Instr::BinOp { op: BinOp::Add, x: i, y: Operand::konst(Const::int(1)) },
        );
        f.push(b2, Instr::Jump);
        f.set_succs(b2, &[b1]);

        // b3: j = phi(0, j2); s = phi(0, s2); if j < 100 goto b4 else b5
        let j = f.push(
            b3,
            Instr::Phi {
                edges: vec![Operand::konst(Const::int(0)), Operand::Instr(b4, 2)],
            },
        );
        let s = f.push(
            b3,
            Instr::Phi {
                edges: vec![Operand::konst(Const::int(0)), Operand::Instr(b4, 1)],
            },
        );
        let cond2 = f.push(
            b3,
            Instr::BinOp { op: BinOp::Lss, x: j.clone(), y: Operand::konst(Const::int(100)) },
        );
        f.push(b3, Instr::If { cond: cond2 });
        f.set_succs(b3, &[b4, b5]);

        // b4: v = <-ch; s2 = s + v; j2 = j + 1
        let v = f.push(
            b4,
            Instr::UnOp { op: UnOp::Recv, x: ch, comma_ok: false },
        );
        f.push(b4, Instr::BinOp { op: BinOp::Add, x: s.clone(), y: v });
        f.push(b4, Instr::BinOp { op: BinOp::Add, x: j, y: Operand::konst(Const::int(1)) });
        f.push(b4, Instr::Jump);
        f.set_succs(b4, &[b3]);

        // b5: total = s; return
        f.push(b5, Instr::Store { addr: Operand::Global(total), val: s });
        f.push(b5, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);

    match interp.get_var_addr("total") {
        Some(Value::Pointer(p)) => match p.load() {
            Value::Int(n) => assert_eq!(n, 4950),
            other => panic!("total holds {}", other),
        },
        other => panic!("no total global: {:?}", other.map(|v| v.to_string())),
    }

    // Every sender decrements the counter on its way out.
    for _ in 0..200 {
        if interp.goroutines() == 1 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(interp.goroutines(), 1);
}

// --- Scenario: interface assertion dispatches an interpreted method ---

#[test]
fn type_assert_and_interface_dispatch() {
    let t = Type::named("T", "main");
    t.set_underlying(Type::strukt(vec![Field::new("n", Type::int())]));
    let read_sig = Type::func(vec![Type::slice(Type::uint8())], vec![Type::int()], false);
    t.add_method(MethodSig { name: "Read".into(), sig: read_sig.clone() });
    let reader = Type::interface(vec![MethodSig { name: "Read".into(), sig: read_sig.clone() }]);
    let ptr_t = Type::pointer(t.clone());

    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let ok_g = prog.add_global(main_pkg, "ok", Type::bool());
    let got_g = prog.add_global(main_pkg, "got", Type::int());

    let read_fn = prog.add_anon_func(main_pkg, "(*T).Read", read_sig);
    {
        let f = prog.func_mut(read_fn);
        f.recv = Some(ptr_t.clone());
        f.add_param("recv", ptr_t.clone());
        f.add_param("p", Type::slice(Type::uint8()));
        let b0 = f.add_block();
        f.push(b0, Instr::Return { results: vec![Operand::konst(Const::int(37))] });
    }
    prog.add_method(&t, "Read", read_fn);

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let tp = f.push(b0, Instr::Alloc { ty: t.clone(), heap: true, local: None });
        let x = f.push(
            b0,
            Instr::MakeInterface { ty: any(), x: tp, x_ty: ptr_t.clone() },
        );
        let ta = f.push(
            b0,
            Instr::TypeAssert {
                x,
                x_ty: any(),
                asserted: reader.clone(),
                comma_ok: true,
            },
        );
        let r = f.push(b0, Instr::Extract { tuple: ta.clone(), index: 0 });
        let ok = f.push(b0, Instr::Extract { tuple: ta, index: 1 });
        f.push(b0, Instr::Store { addr: Operand::Global(ok_g), val: ok });
        let n = f.push(
            b0,
            Instr::Call {
                call: CallCommon::invoke(
                    r,
                    "Read",
                    vec![Operand::konst(Const::nil(Type::slice(Type::uint8())))],
                ),
            },
        );
        f.push(b0, Instr::Store { addr: Operand::Global(got_g), val: n });
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    match interp.get_var_addr("ok") {
        Some(Value::Pointer(p)) => assert!(matches!(p.load(), Value::Bool(true))),
        other => panic!("no ok global: {:?}", other.map(|v| v.to_string())),
    }
    match interp.get_var_addr("got") {
        Some(Value::Pointer(p)) => assert!(matches!(p.load(), Value::Int(37))),
        other => panic!("no got global: {:?}", other.map(|v| v.to_string())),
    }
}

// --- Scenario: string slicing, in range and out of range ---

#[test]
fn string_slice_and_bounds_message() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let out_g = prog.add_global(main_pkg, "out", Type::string());
    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let sub = f.push(
            b0,
            Instr::Slice {
                ty: Type::string(),
                x: Operand::konst(Const::str("hello")),
                low: Some(Operand::konst(Const::int(0))),
                high: Some(Operand::konst(Const::int(3))),
                max: None,
            },
        );
        f.push(b0, Instr::Store { addr: Operand::Global(out_g), val: sub });
        f.push(
            b0,
            Instr::Slice {
                ty: Type::string(),
                x: Operand::konst(Const::str("hello")),
                low: Some(Operand::konst(Const::int(10))),
                high: Some(Operand::konst(Const::int(11))),
                max: None,
            },
        );
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert_eq!(code, 2);
    assert_eq!(
        err.expect("bounds fault expected").to_string(),
        "runtime error: slice bounds out of range [:11] with length 5"
    );
    // The in-range slice completed before the fault.
    match interp.get_var_addr("out") {
        Some(Value::Pointer(p)) => assert_eq!(p.load().to_string(), "hel"),
        other => panic!("no out global: {:?}", other.map(|v| v.to_string())),
    }
}

// --- Scenario: nested defer/recover, outer recover sees nil ---

#[test]
fn nested_recover_inner_swallows_outer_sees_nil() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let outer_g = prog.add_global(main_pkg, "outer_got", any());
    let inner_g = prog.add_global(main_pkg, "inner_got", any());

    let inner_rec = prog.add_func(main_pkg, "inner_rec", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(inner_rec);
        let b0 = f.add_block();
        let r = f.push(
            b0,
            Instr::Call {
                call: CallCommon::call(Operand::Builtin(Builtin::Recover), vec![]),
            },
        );
        f.push(b0, Instr::Store { addr: Operand::Global(inner_g), val: r });
        f.push(b0, Instr::Return { results: vec![] });
    }

    let outer_rec = prog.add_func(main_pkg, "outer_rec", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(outer_rec);
        let b0 = f.add_block();
        let r = f.push(
            b0,
            Instr::Call {
                call: CallCommon::call(Operand::Builtin(Builtin::Recover), vec![]),
            },
        );
        f.push(b0, Instr::Store { addr: Operand::Global(outer_g), val: r });
        f.push(b0, Instr::Return { results: vec![] });
    }

    let inner = prog.add_func(main_pkg, "inner", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(inner);
        let b0 = f.add_block();
        f.push(
            b0,
            Instr::Defer { call: CallCommon::call(Operand::Func(inner_rec), vec![]) },
        );
        f.push(b0, Instr::Panic { x: Operand::konst(Const::str("whoops")) });
    }

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        f.push(
            b0,
            Instr::Defer { call: CallCommon::call(Operand::Func(outer_rec), vec![]) },
        );
        f.push(
            b0,
            Instr::Call { call: CallCommon::call(Operand::Func(inner), vec![]) },
        );
        f.push(b0, Instr::RunDefers);
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    match interp.get_var_addr("inner_got") {
        Some(Value::Pointer(p)) => assert_eq!(p.load().to_string(), "whoops"),
        other => panic!("no inner_got global: {:?}", other.map(|v| v.to_string())),
    }
    match interp.get_var_addr("outer_got") {
        Some(Value::Pointer(p)) => assert!(p.load().is_nil(), "outer recover must see nil"),
        other => panic!("no outer_got global: {:?}", other.map(|v| v.to_string())),
    }
}

// --- Recovered runtime faults keep their error shape ---

#[test]
fn recovered_divide_by_zero_is_an_error_value() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let err_g = prog.add_global(main_pkg, "caught", any());

    let rec = prog.add_func(main_pkg, "rec", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(rec);
        let b0 = f.add_block();
        let r = f.push(
            b0,
            Instr::Call {
                call: CallCommon::call(Operand::Builtin(Builtin::Recover), vec![]),
            },
        );
        f.push(b0, Instr::Store { addr: Operand::Global(err_g), val: r });
        f.push(b0, Instr::Return { results: vec![] });
    }

    let zero_g = prog.add_global(main_pkg, "zero", Type::int());
    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        f.push(
            b0,
            Instr::Defer { call: CallCommon::call(Operand::Func(rec), vec![]) },
        );
        // Divisor loaded from a zeroed global so the division happens
        // at run time.
        let gptr = Operand::Global(zero_g);
        let divisor = f.push(b0, Instr::UnOp { op: UnOp::Deref, x: gptr, comma_ok: false });
        f.push(
            b0,
            Instr::BinOp { op: BinOp::Div, x: Operand::konst(Const::int(1)), y: divisor },
        );
        f.push(b0, Instr::RunDefers);
        f.push(b0, Instr::Return { results: vec![] });
    }

    // describe() asks the recovered payload for its Error() message,
    // dispatching through the runtime error's method set.
    let describe = prog.add_func(
        main_pkg,
        "describe",
        Type::func(vec![], vec![Type::string()], false),
    );
    {
        let f = prog.func_mut(describe);
        let b0 = f.add_block();
        let v = f.push(
            b0,
            Instr::UnOp { op: UnOp::Deref, x: Operand::Global(err_g), comma_ok: false },
        );
        let msg = f.push(
            b0,
            Instr::Call { call: CallCommon::invoke(v, "Error", vec![]) },
        );
        f.push(b0, Instr::Return { results: vec![msg] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "recovered fault must not surface: {:?}", err);
    assert_eq!(code, 0);
    match interp.get_var_addr("caught") {
        Some(Value::Pointer(p)) => {
            assert_eq!(p.load().to_string(), "runtime error: integer divide by zero");
        }
        other => panic!("no caught global: {:?}", other.map(|v| v.to_string())),
    }
    let msg = interp.run_func("describe", vec![]).unwrap();
    assert_eq!(msg.to_string(), "runtime error: integer divide by zero");
}

// --- Closures mutate captured cells ---

#[test]
fn closure_counter_increments_captured_cell() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let out_g = prog.add_global(main_pkg, "count", Type::int());

    let incr = prog.add_anon_func(main_pkg, "main.incr", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(incr);
        let c = f.add_free_var("c", Type::pointer(Type::int()));
        let b0 = f.add_block();
        let cur = f.push(b0, Instr::UnOp { op: UnOp::Deref, x: c.clone(), comma_ok: false });
        let next = f.push(
            b0,
            Instr::BinOp { op: BinOp::Add, x: cur, y: Operand::konst(Const::int(1)) },
        );
        f.push(b0, Instr::Store { addr: c, val: next });
        f.push(b0, Instr::Return { results: vec![] });
    }

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let cell = f.push(b0, Instr::Alloc { ty: Type::int(), heap: true, local: None });
        let cl = f.push(b0, Instr::MakeClosure { func: incr, bindings: vec![cell.clone()] });
        f.push(b0, Instr::Call { call: CallCommon::call(cl.clone(), vec![]) });
        f.push(b0, Instr::Call { call: CallCommon::call(cl, vec![]) });
        let got = f.push(b0, Instr::UnOp { op: UnOp::Deref, x: cell, comma_ok: false });
        f.push(b0, Instr::Store { addr: Operand::Global(out_g), val: got });
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    match interp.get_var_addr("count") {
        Some(Value::Pointer(p)) => assert!(matches!(p.load(), Value::Int(2))),
        other => panic!("no count global: {:?}", other.map(|v| v.to_string())),
    }
}

// --- Map lookup with comma-ok, update, delete ---

#[test]
fn map_lookup_update_delete() {
    let map_ty = Type::map(Type::string(), Type::int());
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let hit_g = prog.add_global(main_pkg, "hit", Type::int());
    let ok_g = prog.add_global(main_pkg, "hit_ok", Type::bool());
    let miss_g = prog.add_global(main_pkg, "miss", Type::int());
    let miss_ok_g = prog.add_global(main_pkg, "miss_ok", Type::bool());
    let len_g = prog.add_global(main_pkg, "n", Type::int());

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let m = f.push(b0, Instr::MakeMap { ty: map_ty.clone(), reserve: None });
        f.push(
            b0,
            Instr::MapUpdate {
                map: m.clone(),
                key: Operand::konst(Const::str("a")),
                val: Operand::konst(Const::int(1)),
            },
        );
        f.push(
            b0,
            Instr::MapUpdate {
                map: m.clone(),
                key: Operand::konst(Const::str("b")),
                val: Operand::konst(Const::int(2)),
            },
        );
        let hit = f.push(
            b0,
            Instr::Lookup {
                x: m.clone(),
                x_ty: map_ty.clone(),
                index: Operand::konst(Const::str("a")),
                comma_ok: true,
            },
        );
        let hit_v = f.push(b0, Instr::Extract { tuple: hit.clone(), index: 0 });
        let hit_ok = f.push(b0, Instr::Extract { tuple: hit, index: 1 });
        f.push(b0, Instr::Store { addr: Operand::Global(hit_g), val: hit_v });
        f.push(b0, Instr::Store { addr: Operand::Global(ok_g), val: hit_ok });
        f.push(
            b0,
            Instr::Call {
                call: CallCommon::call(
                    Operand::Builtin(Builtin::Delete),
                    vec![m.clone(), Operand::konst(Const::str("a"))],
                ),
            },
        );
        let miss = f.push(
            b0,
            Instr::Lookup {
                x: m.clone(),
                x_ty: map_ty.clone(),
                index: Operand::konst(Const::str("a")),
                comma_ok: true,
            },
        );
        let miss_v = f.push(b0, Instr::Extract { tuple: miss.clone(), index: 0 });
        let miss_ok = f.push(b0, Instr::Extract { tuple: miss, index: 1 });
        f.push(b0, Instr::Store { addr: Operand::Global(miss_g), val: miss_v });
        f.push(b0, Instr::Store { addr: Operand::Global(miss_ok_g), val: miss_ok });
        let n = f.push(
            b0,
            Instr::Call {
                call: CallCommon::call(Operand::Builtin(Builtin::Len), vec![m]),
            },
        );
        f.push(b0, Instr::Store { addr: Operand::Global(len_g), val: n });
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    let load = |name: &str| match interp.get_var_addr(name) {
        Some(Value::Pointer(p)) => p.load(),
        other => panic!("no {} global: {:?}", name, other.map(|v| v.to_string())),
    };
    assert!(matches!(load("hit"), Value::Int(1)));
    assert!(matches!(load("hit_ok"), Value::Bool(true)));
    assert!(matches!(load("miss"), Value::Int(0)));
    assert!(matches!(load("miss_ok"), Value::Bool(false)));
    assert!(matches!(load("n"), Value::Int(1)));
}

// --- Select: ready receive wins, default fires when idle ---

#[test]
fn select_receive_and_default() {
    let chan_ty = Type::chan(ChanDir::Both, Type::int());
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let chosen_g = prog.add_global(main_pkg, "chosen", Type::int());
    let got_g = prog.add_global(main_pkg, "got", Type::int());
    let idle_g = prog.add_global(main_pkg, "idle", Type::int());

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let ch = f.push(
            b0,
            Instr::MakeChan { ty: chan_ty.clone(), size: Operand::konst(Const::int(1)) },
        );
        f.push(b0, Instr::Send { chan: ch.clone(), x: Operand::konst(Const::int(9)) });
        let sel = f.push(
            b0,
            Instr::Select {
                states: vec![SelState {
                    dir: ChanDir::RecvOnly,
                    chan: ch.clone(),
                    send: None,
                    elem: Type::int(),
                }],
                blocking: true,
            },
        );
        let chosen = f.push(b0, Instr::Extract { tuple: sel.clone(), index: 0 });
        let got = f.push(b0, Instr::Extract { tuple: sel, index: 2 });
        f.push(b0, Instr::Store { addr: Operand::Global(chosen_g), val: chosen });
        f.push(b0, Instr::Store { addr: Operand::Global(got_g), val: got });
        // Channel now drained: a non-blocking select falls to default.
        let sel2 = f.push(
            b0,
            Instr::Select {
                states: vec![SelState {
                    dir: ChanDir::RecvOnly,
                    chan: ch,
                    send: None,
                    elem: Type::int(),
                }],
                blocking: false,
            },
        );
        let idle = f.push(b0, Instr::Extract { tuple: sel2, index: 0 });
        f.push(b0, Instr::Store { addr: Operand::Global(idle_g), val: idle });
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    let load = |name: &str| match interp.get_var_addr(name) {
        Some(Value::Pointer(p)) => p.load(),
        other => panic!("no {} global: {:?}", name, other.map(|v| v.to_string())),
    };
    assert!(matches!(load("chosen"), Value::Int(0)));
    assert!(matches!(load("got"), Value::Int(9)));
    assert!(matches!(load("idle"), Value::Int(-1)));
}

// --- Range over a string accumulates byte indices and runes ---

#[test]
fn range_over_string() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let count_g = prog.add_global(main_pkg, "runes", Type::int());

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let b1 = f.add_block();
        let b2 = f.add_block();
        let b3 = f.add_block();

        let it = f.push(
            b0,
            Instr::Range { x: Operand::konst(Const::str("héllo")), x_ty: Type::string() },
        );
        f.push(b0, Instr::Jump);
        f.set_succs(b0, &[b1]);

        // b1: n = phi(0, n2); step = next(it); branch on ok
        let n = f.push(
            b1,
            Instr::Phi { edges: vec![Operand::konst(Const::int(0)), Operand::Instr(b2, 0)] },
        );
        let step = f.push(b1, Instr::Next { iter: it, is_string: true });
        let ok = f.push(b1, Instr::Extract { tuple: step, index: 0 });
        f.push(b1, Instr::If { cond: ok });
        f.set_succs(b1, &[b2, b3]);

        // b2: n2 = n + 1
        f.push(b2, Instr::BinOp { op: BinOp::Add, x: n.clone(), y: Operand::konst(Const::int(1)) });
        f.push(b2, Instr::Jump);
        f.set_succs(b2, &[b1]);

        // b3: runes = n
        f.push(b3, Instr::Store { addr: Operand::Global(count_g), val: n });
        f.push(b3, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    match interp.get_var_addr("runes") {
        Some(Value::Pointer(p)) => assert!(matches!(p.load(), Value::Int(5))),
        other => panic!("no runes global: {:?}", other.map(|v| v.to_string())),
    }
}

// --- run_func invokes a named function with marshalled arguments ---

#[test]
fn run_func_add() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let add = prog.add_func(
        main_pkg,
        "add",
        Type::func(vec![Type::int(), Type::int()], vec![Type::int()], false),
    );
    {
        let f = prog.func_mut(add);
        let a = f.add_param("a", Type::int());
        let b = f.add_param("b", Type::int());
        let b0 = f.add_block();
        let s = f.push(b0, Instr::BinOp { op: BinOp::Add, x: a, y: b });
        f.push(b0, Instr::Return { results: vec![s] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let r = interp.run_func("add", vec![Value::Int(19), Value::Int(23)]).unwrap();
    assert!(matches!(r, Value::Int(42)));
    assert!(interp.get_func("add").is_some());
    assert!(matches!(
        interp.run_func("missing", vec![]),
        Err(sago::Error::NoFunction(_))
    ));
}

// --- Entry resolution exit codes ---

#[test]
fn missing_entry_is_exit_one() {
    let mut prog = Program::new();
    prog.add_package("main", "main");
    prog.seal();
    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert_eq!(code, 1);
    assert!(err.is_some());
}

// --- os.Exit unwinds through defers and sets the exit code ---

#[test]
fn os_exit_reaches_run_after_defers() {
    let reg = Registry::new();
    let mut os_pkg = Package::new("os", "os");
    os_pkg.add_func(HostFunc::new("Exit", vec![], false, |_, args| {
        Err(sago::Panic::Exit(args[0].as_index()? as i32))
    }));
    reg.register(os_pkg);

    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let os_prog = prog.add_package("os", "os");
    let exit = prog.add_func(os_prog, "Exit", Type::func(vec![Type::int()], vec![], false));
    let ran_g = prog.add_global(main_pkg, "deferred_ran", Type::bool());

    let mark = prog.add_func(main_pkg, "mark", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(mark);
        let b0 = f.add_block();
        f.push(
            b0,
            Instr::Store {
                addr: Operand::Global(ran_g),
                val: Operand::konst(Const::bool(true)),
            },
        );
        f.push(b0, Instr::Return { results: vec![] });
    }

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        f.push(
            b0,
            Instr::Defer { call: CallCommon::call(Operand::Func(mark), vec![]) },
        );
        f.push(
            b0,
            Instr::Call {
                call: CallCommon::call(Operand::Func(exit), vec![Operand::konst(Const::int(3))]),
            },
        );
        f.push(b0, Instr::RunDefers);
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(reg), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert_eq!(code, 3);
    assert!(err.is_none(), "exit is not an error: {:?}", err);
    match interp.get_var_addr("deferred_ran") {
        Some(Value::Pointer(p)) => {
            assert!(matches!(p.load(), Value::Bool(true)), "defers must run before exit")
        }
        other => panic!("no deferred_ran global: {:?}", other.map(|v| v.to_string())),
    }
}

// --- Select over a nil channel blocks forever, visible in the counter ---

#[test]
fn select_on_nil_channel_blocks_goroutine() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");

    let blocker = prog.add_func(main_pkg, "blocker", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(blocker);
        let b0 = f.add_block();
        f.push(
            b0,
            Instr::Select {
                states: vec![SelState {
                    dir: ChanDir::RecvOnly,
                    chan: Operand::konst(Const::nil(Type::chan(ChanDir::Both, Type::int()))),
                    send: None,
                    elem: Type::int(),
                }],
                blocking: true,
            },
        );
        f.push(b0, Instr::Return { results: vec![] });
    }

    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        f.push(
            b0,
            Instr::Go { call: CallCommon::call(Operand::Func(blocker), vec![]) },
        );
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    // The spawned goroutine never finishes: main plus one blocked task.
    for _ in 0..50 {
        if interp.goroutines() == 2 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(interp.goroutines(), 2);
}

// --- DebugRef feeds the installed debug sink ---

#[test]
fn debug_sink_sees_named_bindings() {
    let mut prog = Program::new();
    let main_pkg = prog.add_package("main", "main");
    let main_fn = prog.add_func(main_pkg, "main", Type::func(vec![], vec![], false));
    {
        let f = prog.func_mut(main_fn);
        let b0 = f.add_block();
        let x = f.push(
            b0,
            Instr::BinOp {
                op: BinOp::Add,
                x: Operand::konst(Const::int(20)),
                y: Operand::konst(Const::int(22)),
            },
        );
        f.push(b0, Instr::DebugRef { name: "x".into(), x });
        f.push(b0, Instr::Return { results: vec![] });
    }
    prog.seal();

    let interp = Interp::new(Arc::new(Registry::new()), prog, "main", Mode::default()).unwrap();
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    interp.set_debug(move |info| {
        sink.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((info.name.clone(), info.value.to_string()));
    });
    let (code, err) = interp.run("main");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(code, 0);
    let seen = seen.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(seen.as_slice(), &[("x".to_string(), "42".to_string())]);
}
