//! The operator kernel: binary and unary operators, slicing, type
//! assertion and conversion.
//!
//! Numeric dispatch takes a fast path per concrete kind; integer
//! arithmetic wraps two's-complement style. The match tables are
//! generated by local macros, one per operator shape.

use crate::chan;
use crate::error::{EvalResult, Panic};
use crate::ssa::{BinOp, UnOp};
use crate::types::{Type, TypeKind};
use crate::value::{equal_values, zero, GoStr, Pointer, SliceValue, StructValue, Value};

fn invalid(x: &Value, op: &str, y: &Value) -> Panic {
    Panic::plain(format!(
        "invalid binary op: {} {} {}",
        x.kind_name(),
        op,
        y.kind_name()
    ))
}

macro_rules! arith {
    ($fname:ident, $sym:expr, $wrap:ident, $fop:tt, $cmul:expr) => {
        fn $fname(x: &Value, y: &Value) -> EvalResult<Value> {
            Ok(match (x, y) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a.$wrap(*b)),
                (Value::Int8(a), Value::Int8(b)) => Value::Int8(a.$wrap(*b)),
                (Value::Int16(a), Value::Int16(b)) => Value::Int16(a.$wrap(*b)),
                (Value::Int32(a), Value::Int32(b)) => Value::Int32(a.$wrap(*b)),
                (Value::Int64(a), Value::Int64(b)) => Value::Int64(a.$wrap(*b)),
                (Value::Uint(a), Value::Uint(b)) => Value::Uint(a.$wrap(*b)),
                (Value::Uint8(a), Value::Uint8(b)) => Value::Uint8(a.$wrap(*b)),
                (Value::Uint16(a), Value::Uint16(b)) => Value::Uint16(a.$wrap(*b)),
                (Value::Uint32(a), Value::Uint32(b)) => Value::Uint32(a.$wrap(*b)),
                (Value::Uint64(a), Value::Uint64(b)) => Value::Uint64(a.$wrap(*b)),
                (Value::Uintptr(a), Value::Uintptr(b)) => Value::Uintptr(a.$wrap(*b)),
                (Value::Float32(a), Value::Float32(b)) => Value::Float32(a $fop b),
                (Value::Float64(a), Value::Float64(b)) => Value::Float64(a $fop b),
                (Value::Complex64(ar, ai), Value::Complex64(br, bi)) => {
                    let (re, im) = $cmul(*ar as f64, *ai as f64, *br as f64, *bi as f64);
                    Value::Complex64(re as f32, im as f32)
                }
                (Value::Complex128(ar, ai), Value::Complex128(br, bi)) => {
                    let (re, im) = $cmul(*ar, *ai, *br, *bi);
                    Value::Complex128(re, im)
                }
                _ => return Err(invalid(x, $sym, y)),
            })
        }
    };
}

arith!(op_sub, "-", wrapping_sub, -, |ar, ai, br, bi| (ar - br, ai - bi));
arith!(op_mul, "*", wrapping_mul, *, |ar: f64, ai: f64, br: f64, bi: f64| {
    (ar * br - ai * bi, ar * bi + ai * br)
});

fn op_add(x: &Value, y: &Value) -> EvalResult<Value> {
    if let (Value::Str(a), Value::Str(b)) = (x, y) {
        let mut bytes = a.as_bytes().to_vec();
        bytes.extend_from_slice(b.as_bytes());
        return Ok(Value::Str(GoStr::from(bytes)));
    }
    arith!(inner, "+", wrapping_add, +, |ar, ai, br, bi| (ar + br, ai + bi));
    inner(x, y)
}

fn complex_div(ar: f64, ai: f64, br: f64, bi: f64) -> (f64, f64) {
    let d = br * br + bi * bi;
    ((ar * br + ai * bi) / d, (ai * br - ar * bi) / d)
}

macro_rules! int_div_arm {
    ($a:ident, $b:ident, $variant:ident, $wrap:ident) => {{
        if *$b == 0 {
            return Err(Panic::runtime("integer divide by zero"));
        }
        Value::$variant($a.$wrap(*$b))
    }};
}

macro_rules! div_like {
    ($fname:ident, $sym:expr, $wrap:ident $(, $pat:pat => $arm:expr)* $(,)?) => {
        fn $fname(x: &Value, y: &Value) -> EvalResult<Value> {
            Ok(match (x, y) {
                (Value::Int(a), Value::Int(b)) => int_div_arm!(a, b, Int, $wrap),
                (Value::Int8(a), Value::Int8(b)) => int_div_arm!(a, b, Int8, $wrap),
                (Value::Int16(a), Value::Int16(b)) => int_div_arm!(a, b, Int16, $wrap),
                (Value::Int32(a), Value::Int32(b)) => int_div_arm!(a, b, Int32, $wrap),
                (Value::Int64(a), Value::Int64(b)) => int_div_arm!(a, b, Int64, $wrap),
                (Value::Uint(a), Value::Uint(b)) => int_div_arm!(a, b, Uint, $wrap),
                (Value::Uint8(a), Value::Uint8(b)) => int_div_arm!(a, b, Uint8, $wrap),
                (Value::Uint16(a), Value::Uint16(b)) => int_div_arm!(a, b, Uint16, $wrap),
                (Value::Uint32(a), Value::Uint32(b)) => int_div_arm!(a, b, Uint32, $wrap),
                (Value::Uint64(a), Value::Uint64(b)) => int_div_arm!(a, b, Uint64, $wrap),
                (Value::Uintptr(a), Value::Uintptr(b)) => int_div_arm!(a, b, Uintptr, $wrap),
                $($pat => $arm,)*
                _ => return Err(invalid(x, $sym, y)),
            })
        }
    };
}

div_like!(
    op_quo, "/", wrapping_div,
    (Value::Float32(a), Value::Float32(b)) => Value::Float32(a / b),
    (Value::Float64(a), Value::Float64(b)) => Value::Float64(a / b),
    (Value::Complex64(ar, ai), Value::Complex64(br, bi)) => {
        let (re, im) = complex_div(*ar as f64, *ai as f64, *br as f64, *bi as f64);
        Value::Complex64(re as f32, im as f32)
    },
    (Value::Complex128(ar, ai), Value::Complex128(br, bi)) => {
        let (re, im) = complex_div(*ar, *ai, *br, *bi);
        Value::Complex128(re, im)
    },
);

div_like!(op_rem, "%", wrapping_rem);

macro_rules! bits {
    ($fname:ident, $sym:expr, $e:tt) => {
        fn $fname(x: &Value, y: &Value) -> EvalResult<Value> {
            Ok(match (x, y) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a $e b),
                (Value::Int8(a), Value::Int8(b)) => Value::Int8(a $e b),
                (Value::Int16(a), Value::Int16(b)) => Value::Int16(a $e b),
                (Value::Int32(a), Value::Int32(b)) => Value::Int32(a $e b),
                (Value::Int64(a), Value::Int64(b)) => Value::Int64(a $e b),
                (Value::Uint(a), Value::Uint(b)) => Value::Uint(a $e b),
                (Value::Uint8(a), Value::Uint8(b)) => Value::Uint8(a $e b),
                (Value::Uint16(a), Value::Uint16(b)) => Value::Uint16(a $e b),
                (Value::Uint32(a), Value::Uint32(b)) => Value::Uint32(a $e b),
                (Value::Uint64(a), Value::Uint64(b)) => Value::Uint64(a $e b),
                (Value::Uintptr(a), Value::Uintptr(b)) => Value::Uintptr(a $e b),
                _ => return Err(invalid(x, $sym, y)),
            })
        }
    };
}

bits!(op_and, "&", &);
bits!(op_or, "|", |);
bits!(op_xor, "^", ^);

fn op_andnot(x: &Value, y: &Value) -> EvalResult<Value> {
    bits!(inner, "&^", &);
    let noty = unop(UnOp::BitNot, y, false)?;
    inner(x, &noty)
}

macro_rules! cmp {
    ($fname:ident, $sym:expr, $e:tt) => {
        fn $fname(x: &Value, y: &Value) -> EvalResult<Value> {
            Ok(Value::Bool(match (x, y) {
                (Value::Int(a), Value::Int(b)) => a $e b,
                (Value::Int8(a), Value::Int8(b)) => a $e b,
                (Value::Int16(a), Value::Int16(b)) => a $e b,
                (Value::Int32(a), Value::Int32(b)) => a $e b,
                (Value::Int64(a), Value::Int64(b)) => a $e b,
                (Value::Uint(a), Value::Uint(b)) => a $e b,
                (Value::Uint8(a), Value::Uint8(b)) => a $e b,
                (Value::Uint16(a), Value::Uint16(b)) => a $e b,
                (Value::Uint32(a), Value::Uint32(b)) => a $e b,
                (Value::Uint64(a), Value::Uint64(b)) => a $e b,
                (Value::Uintptr(a), Value::Uintptr(b)) => a $e b,
                (Value::Float32(a), Value::Float32(b)) => a $e b,
                (Value::Float64(a), Value::Float64(b)) => a $e b,
                (Value::Str(a), Value::Str(b)) => a $e b,
                _ => return Err(invalid(x, $sym, y)),
            }))
        }
    };
}

cmp!(op_lss, "<", <);
cmp!(op_leq, "<=", <=);
cmp!(op_gtr, ">", >);
cmp!(op_geq, ">=", >=);

// ── Shifts ───────────────────────────────────────────────────────────

/// Shift count as an unsigned 64-bit integer. Negative counts fault.
fn shift_count(y: &Value) -> EvalResult<u64> {
    let n = match y {
        Value::Uint(u) | Value::Uint64(u) | Value::Uintptr(u) => return Ok(*u),
        Value::Uint8(u) => return Ok(*u as u64),
        Value::Uint16(u) => return Ok(*u as u64),
        Value::Uint32(u) => return Ok(*u as u64),
        Value::Int(i) | Value::Int64(i) => *i,
        Value::Int8(i) => *i as i64,
        Value::Int16(i) => *i as i64,
        Value::Int32(i) => *i as i64,
        other => return Err(Panic::plain(format!("invalid shift count {}", other.kind_name()))),
    };
    if n < 0 {
        return Err(Panic::runtime("negative shift amount"));
    }
    Ok(n as u64)
}

macro_rules! shl_arm {
    ($a:ident, $n:ident, $variant:ident, $bits:expr) => {
        if $n >= $bits {
            Value::$variant(0)
        } else {
            Value::$variant($a.wrapping_shl($n as u32))
        }
    };
}

fn op_shl(x: &Value, y: &Value) -> EvalResult<Value> {
    let n = shift_count(y)?;
    Ok(match x {
        Value::Int(a) => shl_arm!(a, n, Int, 64),
        Value::Int8(a) => shl_arm!(a, n, Int8, 8),
        Value::Int16(a) => shl_arm!(a, n, Int16, 16),
        Value::Int32(a) => shl_arm!(a, n, Int32, 32),
        Value::Int64(a) => shl_arm!(a, n, Int64, 64),
        Value::Uint(a) => shl_arm!(a, n, Uint, 64),
        Value::Uint8(a) => shl_arm!(a, n, Uint8, 8),
        Value::Uint16(a) => shl_arm!(a, n, Uint16, 16),
        Value::Uint32(a) => shl_arm!(a, n, Uint32, 32),
        Value::Uint64(a) => shl_arm!(a, n, Uint64, 64),
        Value::Uintptr(a) => shl_arm!(a, n, Uintptr, 64),
        _ => return Err(invalid(x, "<<", y)),
    })
}

macro_rules! sshr_arm {
    ($a:ident, $n:ident, $variant:ident, $bits:expr) => {
        Value::$variant(*$a >> ($n.min($bits - 1) as u32))
    };
}

macro_rules! ushr_arm {
    ($a:ident, $n:ident, $variant:ident, $bits:expr) => {
        if $n >= $bits {
            Value::$variant(0)
        } else {
            Value::$variant($a >> ($n as u32))
        }
    };
}

fn op_shr(x: &Value, y: &Value) -> EvalResult<Value> {
    let n = shift_count(y)?;
    Ok(match x {
        // Arithmetic shift: over-wide counts sign-fill.
        Value::Int(a) => sshr_arm!(a, n, Int, 64),
        Value::Int8(a) => sshr_arm!(a, n, Int8, 8),
        Value::Int16(a) => sshr_arm!(a, n, Int16, 16),
        Value::Int32(a) => sshr_arm!(a, n, Int32, 32),
        Value::Int64(a) => sshr_arm!(a, n, Int64, 64),
        Value::Uint(a) => ushr_arm!(a, n, Uint, 64),
        Value::Uint8(a) => ushr_arm!(a, n, Uint8, 8),
        Value::Uint16(a) => ushr_arm!(a, n, Uint16, 16),
        Value::Uint32(a) => ushr_arm!(a, n, Uint32, 32),
        Value::Uint64(a) => ushr_arm!(a, n, Uint64, 64),
        Value::Uintptr(a) => ushr_arm!(a, n, Uintptr, 64),
        _ => return Err(invalid(x, ">>", y)),
    })
}

/// Equality with nil-literal awareness: `x == nil` tests nil-ness even
/// for kinds that are otherwise uncomparable.
pub fn eql(x: &Value, y: &Value, x_nil_const: bool, y_nil_const: bool) -> EvalResult<bool> {
    if x_nil_const {
        return Ok(y.is_nil());
    }
    if y_nil_const {
        return Ok(x.is_nil());
    }
    equal_values(x, y)
}

pub fn binop(
    op: BinOp,
    x: &Value,
    y: &Value,
    x_nil_const: bool,
    y_nil_const: bool,
) -> EvalResult<Value> {
    match op {
        BinOp::Add => op_add(x, y),
        BinOp::Sub => op_sub(x, y),
        BinOp::Mul => op_mul(x, y),
        BinOp::Div => op_quo(x, y),
        BinOp::Rem => op_rem(x, y),
        BinOp::And => op_and(x, y),
        BinOp::Or => op_or(x, y),
        BinOp::Xor => op_xor(x, y),
        BinOp::AndNot => op_andnot(x, y),
        BinOp::Shl => op_shl(x, y),
        BinOp::Shr => op_shr(x, y),
        BinOp::Lss => op_lss(x, y),
        BinOp::Leq => op_leq(x, y),
        BinOp::Gtr => op_gtr(x, y),
        BinOp::Geq => op_geq(x, y),
        BinOp::Eql => Ok(Value::Bool(eql(x, y, x_nil_const, y_nil_const)?)),
        BinOp::Neq => Ok(Value::Bool(!eql(x, y, x_nil_const, y_nil_const)?)),
    }
}

pub fn unop(op: UnOp, x: &Value, comma_ok: bool) -> EvalResult<Value> {
    match op {
        UnOp::Neg => Ok(match x {
            Value::Int(a) => Value::Int(a.wrapping_neg()),
            Value::Int8(a) => Value::Int8(a.wrapping_neg()),
            Value::Int16(a) => Value::Int16(a.wrapping_neg()),
            Value::Int32(a) => Value::Int32(a.wrapping_neg()),
            Value::Int64(a) => Value::Int64(a.wrapping_neg()),
            Value::Uint(a) => Value::Uint(a.wrapping_neg()),
            Value::Uint8(a) => Value::Uint8(a.wrapping_neg()),
            Value::Uint16(a) => Value::Uint16(a.wrapping_neg()),
            Value::Uint32(a) => Value::Uint32(a.wrapping_neg()),
            Value::Uint64(a) => Value::Uint64(a.wrapping_neg()),
            Value::Uintptr(a) => Value::Uintptr(a.wrapping_neg()),
            Value::Float32(a) => Value::Float32(-a),
            Value::Float64(a) => Value::Float64(-a),
            Value::Complex64(re, im) => Value::Complex64(-re, -im),
            Value::Complex128(re, im) => Value::Complex128(-re, -im),
            _ => return Err(Panic::plain(format!("invalid unary op - {}", x.kind_name()))),
        }),
        UnOp::Not => match x {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            _ => Err(Panic::plain(format!("invalid unary op ! {}", x.kind_name()))),
        },
        UnOp::BitNot => Ok(match x {
            Value::Int(a) => Value::Int(!a),
            Value::Int8(a) => Value::Int8(!a),
            Value::Int16(a) => Value::Int16(!a),
            Value::Int32(a) => Value::Int32(!a),
            Value::Int64(a) => Value::Int64(!a),
            Value::Uint(a) => Value::Uint(!a),
            Value::Uint8(a) => Value::Uint8(!a),
            Value::Uint16(a) => Value::Uint16(!a),
            Value::Uint32(a) => Value::Uint32(!a),
            Value::Uint64(a) => Value::Uint64(!a),
            Value::Uintptr(a) => Value::Uintptr(!a),
            _ => return Err(Panic::plain(format!("invalid unary op ^ {}", x.kind_name()))),
        }),
        UnOp::Deref => match x {
            Value::Pointer(p) => Ok(p.load()),
            Value::Nil => Err(Panic::runtime("invalid memory address or nil pointer dereference")),
            _ => Err(Panic::plain(format!("cannot dereference {}", x.kind_name()))),
        },
        UnOp::Recv => match x {
            Value::Chan(ch) => {
                let (v, ok) = ch.recv();
                if comma_ok {
                    Ok(Value::tuple(vec![v, Value::Bool(ok)]))
                } else {
                    Ok(v)
                }
            }
            Value::Nil => chan::block_forever(),
            _ => Err(Panic::plain(format!("receive from {}", x.kind_name()))),
        },
    }
}

/// Bounds-check an index against a length, with the source fault
/// messages.
pub fn check_index(index: i64, length: usize) -> EvalResult<usize> {
    if index < 0 {
        return Err(Panic::runtime(format!("index out of range [{}]", index)));
    }
    if index as usize >= length {
        return Err(Panic::runtime(format!(
            "index out of range [{}] with length {}",
            index, length
        )));
    }
    Ok(index as usize)
}

// ── Slicing ──────────────────────────────────────────────────────────

/// x[lo:hi:max] over strings, slices, arrays and pointers to arrays.
/// `from_alloc` marks the composite-literal path, which reports
/// makeslice-style faults.
pub fn slice_op(
    x: &Value,
    lo: Option<i64>,
    hi: Option<i64>,
    max: Option<i64>,
    from_alloc: bool,
) -> EvalResult<Value> {
    enum Backing {
        Str(GoStr),
        Slice(SliceValue),
        Arr(std::sync::Arc<parking_lot::Mutex<Vec<Value>>>, Type),
    }

    let (backing, len, cap, is_slice_kind) = match x {
        Value::Str(s) => (Backing::Str(s.clone()), s.len(), s.len(), false),
        Value::Slice(s) => (Backing::Slice(s.clone()), s.len, s.cap, true),
        Value::Array(a) => {
            let n = a.len();
            (Backing::Arr(a.arr.clone(), a.elem.clone()), n, n, false)
        }
        Value::Pointer(p) => match p.raw() {
            Value::Array(a) => {
                let n = a.len();
                (Backing::Arr(a.arr.clone(), a.elem.clone()), n, n, false)
            }
            other => {
                return Err(Panic::plain(format!("slice of {}", other.kind_name())));
            }
        },
        Value::Nil => {
            return Err(Panic::runtime("invalid memory address or nil pointer dereference"))
        }
        other => return Err(Panic::plain(format!("slice of {}", other.kind_name()))),
    };

    let l = lo.unwrap_or(0);
    let h = hi.unwrap_or(len as i64);
    let slice3 = max.is_some();
    let m = max.unwrap_or(cap as i64);
    let cap = cap as i64;

    if from_alloc {
        if h < 0 {
            return Err(Panic::runtime("makeslice: len out of range"));
        } else if h > m {
            return Err(Panic::runtime("makeslice: cap out of range"));
        }
    } else if slice3 {
        if m < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [::{}]", m)));
        } else if m > cap {
            if is_slice_kind {
                return Err(Panic::runtime(format!(
                    "slice bounds out of range [::{}] with capacity {}",
                    m, cap
                )));
            }
            return Err(Panic::runtime(format!(
                "slice bounds out of range [::{}] with length {}",
                m, cap
            )));
        } else if h < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [:{}:]", h)));
        } else if h > m {
            return Err(Panic::runtime(format!("slice bounds out of range [:{}:{}]", h, m)));
        } else if l < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [{}::]", l)));
        } else if l > h {
            return Err(Panic::runtime(format!("slice bounds out of range [{}:{}:]", l, h)));
        }
    } else {
        if h < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [:{}]", h)));
        } else if h > cap {
            if is_slice_kind {
                return Err(Panic::runtime(format!(
                    "slice bounds out of range [:{}] with capacity {}",
                    h, cap
                )));
            }
            return Err(Panic::runtime(format!(
                "slice bounds out of range [:{}] with length {}",
                h, cap
            )));
        } else if l < 0 {
            return Err(Panic::runtime(format!("slice bounds out of range [{}:]", l)));
        } else if l > h {
            return Err(Panic::runtime(format!("slice bounds out of range [{}:{}]", l, h)));
        }
    }

    let (l, h, m) = (l as usize, h as usize, m as usize);
    Ok(match backing {
        Backing::Str(s) => Value::Str(s.slice(l, h)),
        Backing::Slice(s) => Value::Slice(s.reslice(l, h, m)),
        Backing::Arr(arr, elem) => Value::Slice(SliceValue {
            arr,
            off: l,
            len: h - l,
            cap: m - l,
            elem,
            nil: false,
        }),
    })
}

// ── Type assertion and conversion ────────────────────────────────────

/// Checks whether the dynamic type of `x` is (assignable to) the
/// asserted type. Panics on failure unless `comma_ok`, which always
/// yields a (value, ok) tuple.
pub fn type_assert(
    x: &Value,
    x_static: &Type,
    asserted: &Type,
    comma_ok: bool,
) -> EvalResult<Value> {
    let outcome = type_assert_inner(x, x_static, asserted);
    match outcome {
        Ok(v) => {
            if comma_ok {
                Ok(Value::tuple(vec![v, Value::Bool(true)]))
            } else {
                Ok(v)
            }
        }
        Err(p) => {
            if comma_ok {
                Ok(Value::tuple(vec![zero(asserted), Value::Bool(false)]))
            } else {
                Err(p)
            }
        }
    }
}

fn type_assert_inner(x: &Value, x_static: &Type, asserted: &Type) -> EvalResult<Value> {
    let iv = match x {
        Value::Nil => {
            return Err(Panic::runtime(format!(
                "interface conversion: interface is nil, not {}",
                asserted
            )))
        }
        Value::Iface(iv) => iv,
        // A bare value can reach an assertion through a native
        // boundary; pass it through unchanged.
        other => return Ok(other.clone()),
    };
    let dyn_ty = iv.rtype.ty().clone();

    if let Some(iface_methods) = asserted.interface_methods() {
        // Interface target: the dynamic method set must cover it. The
        // synthesized host method table backs up the declared set.
        for want in &iface_methods {
            let declared_ok = dyn_ty.missing_method(std::slice::from_ref(want)).is_none();
            if !declared_ok && iv.rtype.method_by_name(&want.name).is_none() {
                return Err(Panic::runtime(format!(
                    "interface conversion: {} is not {}: missing method {}",
                    dyn_ty, asserted, want.name
                )));
            }
        }
        return Ok(x.clone());
    }

    if dyn_ty.identical(asserted) {
        return Ok(iv.val.clone());
    }
    // Assignable but not identical: unnamed side adopts the named
    // side's representation.
    let same_underlying = dyn_ty.underlying().identical(&asserted.underlying());
    if same_underlying && (!dyn_ty.is_named() || !asserted.is_named()) {
        return convert(&iv.val, asserted);
    }
    if let (Some((dn, dp)), Some((an, ap))) = (dyn_ty.name_and_path(), asserted.name_and_path()) {
        if dn == an && dp == ap {
            return Err(Panic::runtime(format!(
                "interface conversion: {} is {}, not {} (types from different scopes)",
                x_static, dyn_ty, asserted
            )));
        }
    }
    Err(Panic::runtime(format!(
        "interface conversion: {} is {}, not {}",
        x_static, dyn_ty, asserted
    )))
}

fn int_payload(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) | Value::Int64(i) => Some(*i),
        Value::Int8(i) => Some(*i as i64),
        Value::Int16(i) => Some(*i as i64),
        Value::Int32(i) => Some(*i as i64),
        Value::Uint(u) | Value::Uint64(u) | Value::Uintptr(u) => Some(*u as i64),
        Value::Uint8(u) => Some(*u as i64),
        Value::Uint16(u) => Some(*u as i64),
        Value::Uint32(u) => Some(*u as i64),
        _ => None,
    }
}

fn float_payload(v: &Value) -> Option<f64> {
    match v {
        Value::Float32(f) => Some(*f as f64),
        Value::Float64(f) => Some(*f),
        _ => None,
    }
}

/// Value conversion honoring the source language's rules: numeric
/// truncation/extension and signed/unsigned reinterpretation, string
/// to and from byte and rune slices, integer to string-of-rune, and
/// representation-preserving conversions between types that share an
/// underlying type.
pub fn convert(x: &Value, to: &Type) -> EvalResult<Value> {
    let target = to.underlying();
    let fail = || Panic::plain(format!("cannot convert {} to {}", x.kind_name(), to));

    macro_rules! to_int {
        ($variant:ident, $prim:ty) => {{
            if let Some(i) = int_payload(x) {
                return Ok(Value::$variant(i as $prim));
            }
            if let Some(f) = float_payload(x) {
                return Ok(Value::$variant(f as $prim));
            }
            return Err(fail());
        }};
    }

    match target.kind() {
        TypeKind::Bool => match x {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            _ => Err(fail()),
        },
        TypeKind::Int => to_int!(Int, i64),
        TypeKind::Int8 => to_int!(Int8, i8),
        TypeKind::Int16 => to_int!(Int16, i16),
        TypeKind::Int32 => to_int!(Int32, i32),
        TypeKind::Int64 => to_int!(Int64, i64),
        TypeKind::Uint => to_int!(Uint, u64),
        TypeKind::Uint8 => to_int!(Uint8, u8),
        TypeKind::Uint16 => to_int!(Uint16, u16),
        TypeKind::Uint32 => to_int!(Uint32, u32),
        TypeKind::Uint64 => to_int!(Uint64, u64),
        TypeKind::Uintptr => to_int!(Uintptr, u64),
        TypeKind::Float32 => {
            if let Some(f) = float_payload(x) {
                return Ok(Value::Float32(f as f32));
            }
            if let Some(i) = int_payload(x) {
                return Ok(Value::Float32(i as f32));
            }
            Err(fail())
        }
        TypeKind::Float64 => {
            if let Some(f) = float_payload(x) {
                return Ok(Value::Float64(f));
            }
            if let Some(i) = int_payload(x) {
                return Ok(Value::Float64(i as f64));
            }
            Err(fail())
        }
        TypeKind::Complex64 => match x {
            Value::Complex64(re, im) => Ok(Value::Complex64(*re, *im)),
            Value::Complex128(re, im) => Ok(Value::Complex64(*re as f32, *im as f32)),
            _ => Err(fail()),
        },
        TypeKind::Complex128 => match x {
            Value::Complex64(re, im) => Ok(Value::Complex128(*re as f64, *im as f64)),
            Value::Complex128(re, im) => Ok(Value::Complex128(*re, *im)),
            _ => Err(fail()),
        },
        TypeKind::String => match x {
            Value::Str(s) => Ok(Value::Str(s.clone())),
            Value::Slice(s) => {
                let items = s.snapshot();
                match s.elem.underlying().kind() {
                    TypeKind::Uint8 => {
                        let bytes: Vec<u8> = items
                            .iter()
                            .map(|v| match v {
                                Value::Uint8(b) => *b,
                                _ => 0,
                            })
                            .collect();
                        Ok(Value::Str(GoStr::from(bytes)))
                    }
                    TypeKind::Int32 => {
                        let mut out = String::new();
                        for v in &items {
                            let r = int_payload(v).unwrap_or(0);
                            out.push(char::from_u32(r as u32).unwrap_or('\u{FFFD}'));
                        }
                        Ok(Value::str(out.as_str()))
                    }
                    _ => Err(fail()),
                }
            }
            _ => {
                if let Some(i) = int_payload(x) {
                    let c = char::from_u32(i as u32).unwrap_or('\u{FFFD}');
                    return Ok(Value::str(c.to_string().as_str()));
                }
                Err(fail())
            }
        },
        TypeKind::Slice(elem) => match (x, elem.underlying().kind()) {
            (Value::Str(s), TypeKind::Uint8) => {
                let items = s.as_bytes().iter().map(|b| Value::Uint8(*b)).collect();
                Ok(Value::Slice(SliceValue::from_vec(elem.clone(), items)))
            }
            (Value::Str(s), TypeKind::Int32) => {
                let mut items = Vec::new();
                let mut it = crate::value::StrIter::new(s.clone());
                loop {
                    let (ok, _, r) = it.next();
                    if !ok {
                        break;
                    }
                    items.push(Value::Int32(r));
                }
                Ok(Value::Slice(SliceValue::from_vec(elem.clone(), items)))
            }
            (Value::Slice(s), _) => Ok(Value::Slice(s.clone())),
            (Value::Nil, _) => Ok(Value::Slice(SliceValue::nil_slice(elem.clone()))),
            _ => Err(fail()),
        },
        TypeKind::Struct(_) => match x {
            // Conversion copies and retags with the target type.
            Value::Struct(s) => {
                let copied = s.deep_copy();
                Ok(Value::Struct(StructValue { ty: to.clone(), fields: copied.fields }))
            }
            _ => Err(fail()),
        },
        TypeKind::Pointer(elem) => match x {
            Value::Pointer(p) => Ok(Value::Pointer(Pointer {
                elem: elem.clone(),
                place: p.place.clone(),
            })),
            Value::Nil => Ok(Value::Nil),
            _ => Err(fail()),
        },
        TypeKind::Map(..) | TypeKind::Chan(..) | TypeKind::Func(_) | TypeKind::Interface(_) => {
            Ok(x.clone())
        }
        TypeKind::Array(..) | TypeKind::Tuple(_) => Ok(x.clone()),
        TypeKind::Named(_) => unreachable!("underlying resolved above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_wraps() {
        let r = binop(BinOp::Add, &Value::Int8(127), &Value::Int8(1), false, false).unwrap();
        assert!(matches!(r, Value::Int8(-128)));
        let r = binop(BinOp::Mul, &Value::Int(3), &Value::Int(4), false, false).unwrap();
        assert!(matches!(r, Value::Int(12)));
    }

    #[test]
    fn divide_by_zero_faults() {
        let err = binop(BinOp::Div, &Value::Int(1), &Value::Int(0), false, false).unwrap_err();
        assert_eq!(err.to_string(), "runtime error: integer divide by zero");
        // Float division does not fault.
        let r = binop(BinOp::Div, &Value::Float64(1.0), &Value::Float64(0.0), false, false)
            .unwrap();
        assert!(matches!(r, Value::Float64(f) if f.is_infinite()));
    }

    #[test]
    fn negative_shift_faults() {
        let err = binop(BinOp::Shl, &Value::Int(1), &Value::Int(-1), false, false).unwrap_err();
        assert_eq!(err.to_string(), "runtime error: negative shift amount");
        let r = binop(BinOp::Shl, &Value::Uint8(1), &Value::Uint(9), false, false).unwrap();
        assert!(matches!(r, Value::Uint8(0)));
        let r = binop(BinOp::Shr, &Value::Int8(-8), &Value::Uint(20), false, false).unwrap();
        assert!(matches!(r, Value::Int8(-1)));
    }

    #[test]
    fn string_concat_and_compare() {
        let a = Value::str("he");
        let b = Value::str("llo");
        let r = binop(BinOp::Add, &a, &b, false, false).unwrap();
        assert_eq!(r.to_string(), "hello");
        let lt = binop(BinOp::Lss, &Value::str("a"), &Value::str("b"), false, false).unwrap();
        assert!(matches!(lt, Value::Bool(true)));
    }

    #[test]
    fn two_index_slice_bounds_message() {
        let s = Value::str("hello");
        let ok = slice_op(&s, Some(0), Some(3), None, false).unwrap();
        assert_eq!(ok.to_string(), "hel");
        let err = slice_op(&s, Some(10), Some(11), None, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "runtime error: slice bounds out of range [:11] with length 5"
        );
    }

    #[test]
    fn three_index_slice_bound_order() {
        let s = Value::Slice(SliceValue::from_vec(
            Type::int(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        ));
        let err = slice_op(&s, Some(0), Some(2), Some(9), false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "runtime error: slice bounds out of range [::9] with capacity 3"
        );
        let err = slice_op(&s, Some(2), Some(1), Some(3), false).unwrap_err();
        assert_eq!(err.to_string(), "runtime error: slice bounds out of range [2:1:]");
        let r = slice_op(&s, Some(0), Some(1), Some(2), false).unwrap();
        match r {
            Value::Slice(sl) => {
                assert_eq!(sl.len, 1);
                assert_eq!(sl.cap, 2);
            }
            other => panic!("expected slice, got {}", other),
        }
    }

    #[test]
    fn convert_numeric_roundtrip_within_category() {
        let x = Value::Int(1000);
        let t = convert(&x, &Type::int16()).unwrap();
        let back = convert(&t, &Type::int()).unwrap();
        assert!(matches!(back, Value::Int(1000)));
        // Truncation reinterprets.
        let t = convert(&Value::Int(300), &Type::uint8()).unwrap();
        assert!(matches!(t, Value::Uint8(44)));
    }

    #[test]
    fn convert_string_bytes_runes() {
        let s = Value::str("hé");
        let bytes = convert(&s, &Type::slice(Type::uint8())).unwrap();
        match &bytes {
            Value::Slice(b) => assert_eq!(b.len, 3),
            other => panic!("expected byte slice, got {}", other),
        }
        let back = convert(&bytes, &Type::string()).unwrap();
        assert_eq!(back.to_string(), "hé");
        let runes = convert(&s, &Type::slice(Type::int32())).unwrap();
        match runes {
            Value::Slice(r) => assert_eq!(r.len, 2),
            other => panic!("expected rune slice, got {}", other),
        }
        let one = convert(&Value::Int(0x2603), &Type::string()).unwrap();
        assert_eq!(one.to_string(), "☃");
    }

    #[test]
    fn nil_const_equality() {
        let s = zero(&Type::slice(Type::int()));
        assert!(eql(&s, &Value::Nil, false, true).unwrap());
        let full = Value::Slice(SliceValue::from_vec(Type::int(), vec![Value::Int(1)]));
        assert!(!eql(&full, &Value::Nil, false, true).unwrap());
    }
}
