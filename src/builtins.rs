//! The built-in function catalog and the captured-output shim.

use std::io::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge;
use crate::error::{EvalResult, Panic};
use crate::interp::{Interp, PanicCell};
use crate::ssa::Builtin;
use crate::value::{zero, SliceValue, Value};

/// When enabled, everything the program prints is duplicated here
/// before going to standard output. Process-wide, shared by every
/// engine in the process.
static CAPTURED: Mutex<Option<Vec<u8>>> = Mutex::new(None);

/// Start or stop duplicating program output into the capture buffer.
pub fn capture_output(enable: bool) {
    let mut g = CAPTURED.lock();
    *g = if enable { Some(Vec::new()) } else { None };
}

/// Drain the capture buffer.
pub fn take_captured() -> Vec<u8> {
    let mut g = CAPTURED.lock();
    match g.as_mut() {
        Some(buf) => std::mem::take(buf),
        None => Vec::new(),
    }
}

/// The write shim `print`/`println` and registered output natives
/// funnel through: bytes go to the capture buffer (when enabled) and
/// then to standard output.
pub fn write_output(b: &[u8]) {
    {
        let mut g = CAPTURED.lock();
        if let Some(buf) = g.as_mut() {
            buf.extend_from_slice(b);
        }
    }
    let mut out = std::io::stdout();
    let _ = out.write_all(b);
    let _ = out.flush();
}

pub(crate) fn call_builtin(
    interp: &Arc<Interp>,
    caller: Option<&Arc<PanicCell>>,
    b: Builtin,
    args: Vec<Value>,
) -> EvalResult<Value> {
    match b {
        Builtin::Append => builtin_append(args),
        Builtin::Copy => builtin_copy(args),
        Builtin::Close => match &args[0] {
            Value::Chan(c) => {
                c.close()?;
                Ok(Value::Nil)
            }
            Value::Nil => Err(Panic::runtime("close of nil channel")),
            other => Err(Panic::plain(format!("close of {}", other.kind_name()))),
        },
        Builtin::Delete => match &args[0] {
            Value::Map(m) => {
                m.remove(&args[1])?;
                Ok(Value::Nil)
            }
            Value::Nil => Ok(Value::Nil),
            other => Err(Panic::plain(format!("delete on {}", other.kind_name()))),
        },
        Builtin::Print | Builtin::Println => {
            let ln = b == Builtin::Println;
            let mut out = String::new();
            for (i, a) in args.iter().enumerate() {
                if i > 0 && ln {
                    out.push(' ');
                }
                out.push_str(&a.to_string());
            }
            if ln {
                out.push('\n');
            }
            write_output(out.as_bytes());
            Ok(Value::Nil)
        }
        Builtin::Len => Ok(Value::Int(match &args[0] {
            Value::Str(s) => s.len() as i64,
            Value::Slice(s) => s.len as i64,
            Value::Map(m) => m.len() as i64,
            Value::Chan(c) => c.len() as i64,
            Value::Array(a) => a.len() as i64,
            Value::Pointer(p) => match p.raw() {
                Value::Array(a) => a.len() as i64,
                other => return Err(Panic::plain(format!("len of {}", other.kind_name()))),
            },
            Value::Nil => 0,
            other => return Err(Panic::plain(format!("len of {}", other.kind_name()))),
        })),
        Builtin::Cap => Ok(Value::Int(match &args[0] {
            Value::Slice(s) => s.cap as i64,
            Value::Chan(c) => c.cap() as i64,
            Value::Array(a) => a.len() as i64,
            Value::Pointer(p) => match p.raw() {
                Value::Array(a) => a.len() as i64,
                other => return Err(Panic::plain(format!("cap of {}", other.kind_name()))),
            },
            Value::Nil => 0,
            other => return Err(Panic::plain(format!("cap of {}", other.kind_name()))),
        })),
        Builtin::Real => match &args[0] {
            Value::Complex64(re, _) => Ok(Value::Float32(*re)),
            Value::Complex128(re, _) => Ok(Value::Float64(*re)),
            other => Err(Panic::plain(format!("real of {}", other.kind_name()))),
        },
        Builtin::Imag => match &args[0] {
            Value::Complex64(_, im) => Ok(Value::Float32(*im)),
            Value::Complex128(_, im) => Ok(Value::Float64(*im)),
            other => Err(Panic::plain(format!("imag of {}", other.kind_name()))),
        },
        Builtin::Complex => match (&args[0], &args[1]) {
            (Value::Float32(re), Value::Float32(im)) => Ok(Value::Complex64(*re, *im)),
            (Value::Float64(re), Value::Float64(im)) => Ok(Value::Complex128(*re, *im)),
            (re, _) => Err(Panic::plain(format!("complex of {}", re.kind_name()))),
        },
        Builtin::Panic => Err(Panic::Target(args.into_iter().next().unwrap_or(Value::Nil))),
        Builtin::Recover => Ok(do_recover(interp, caller)),
        Builtin::WrapNilChk => {
            let recv = args[0].clone();
            if recv.is_nil() {
                let recv_ty = args.get(1).map(|v| v.to_string()).unwrap_or_default();
                let method = args.get(2).map(|v| v.to_string()).unwrap_or_default();
                let info = recv_ty.strip_prefix("main.").unwrap_or(&recv_ty);
                return Err(Panic::plain(format!(
                    "value method {}.{} called using nil *{} pointer",
                    recv_ty, method, info
                )));
            }
            Ok(recv)
        }
    }
}

fn builtin_append(args: Vec<Value>) -> EvalResult<Value> {
    if args.len() == 1 {
        return Ok(args.into_iter().next().unwrap());
    }
    let extra: Vec<Value> = match &args[1] {
        Value::Slice(s) => s.snapshot(),
        // append([]byte, string...)
        Value::Str(s) => s.as_bytes().iter().map(|b| Value::Uint8(*b)).collect(),
        Value::Nil => Vec::new(),
        other => return Err(Panic::plain(format!("append of {}", other.kind_name()))),
    };
    let base = match &args[0] {
        Value::Slice(s) => s.clone(),
        Value::Nil => {
            let elem = match &args[1] {
                Value::Slice(s) => s.elem.clone(),
                _ => crate::types::Type::uint8(),
            };
            SliceValue::nil_slice(elem)
        }
        other => return Err(Panic::plain(format!("append to {}", other.kind_name()))),
    };
    if extra.is_empty() {
        return Ok(Value::Slice(base));
    }
    let n = extra.len();
    let total = base.len.checked_add(n).ok_or_else(|| {
        Panic::runtime("growslice: cap out of range")
    })?;
    let elem = base.elem.clone();
    if total <= base.cap {
        // Room in the backing store: write in place, visible to
        // aliases of the same array.
        {
            let mut arr = base.arr.lock();
            for (i, v) in extra.into_iter().enumerate() {
                arr[base.off + base.len + i] = v;
            }
        }
        return Ok(Value::Slice(SliceValue {
            arr: base.arr.clone(),
            off: base.off,
            len: total,
            cap: base.cap,
            elem,
            nil: false,
        }));
    }
    let newcap = total.max(base.cap * 2).max(4);
    let mut items = base.snapshot();
    items.extend(extra);
    items.resize_with(newcap, || zero(&elem));
    Ok(Value::Slice(SliceValue {
        arr: Arc::new(Mutex::new(items)),
        off: 0,
        len: total,
        cap: newcap,
        elem,
        nil: false,
    }))
}

fn builtin_copy(args: Vec<Value>) -> EvalResult<Value> {
    let n = match (&args[0], &args[1]) {
        (Value::Slice(dst), Value::Slice(src)) => {
            let n = dst.len.min(src.len);
            let items = src.snapshot();
            let mut arr = dst.arr.lock();
            for (i, item) in items.into_iter().take(n).enumerate() {
                arr[dst.off + i] = item;
            }
            n
        }
        (Value::Slice(dst), Value::Str(src)) => {
            let bytes = src.as_bytes();
            let n = dst.len.min(bytes.len());
            let mut arr = dst.arr.lock();
            for (i, b) in bytes.iter().take(n).enumerate() {
                arr[dst.off + i] = Value::Uint8(*b);
            }
            n
        }
        (Value::Nil, _) | (_, Value::Nil) => 0,
        (d, _) => return Err(Panic::plain(format!("copy to {}", d.kind_name()))),
    };
    Ok(Value::Int(n as i64))
}

/// The `recover` built-in. Succeeds only two frames below the
/// panicking frame: the deferred call's frame must not itself be
/// panicking while its caller is. Clears the panic and returns the
/// payload with its kind preserved; exit panics are not recoverable.
pub(crate) fn do_recover(interp: &Interp, caller: Option<&Arc<PanicCell>>) -> Value {
    if interp.mode().disable_recover {
        return Value::Nil;
    }
    let Some(c) = caller else {
        return Value::Nil;
    };
    if c.panicking() {
        return Value::Nil;
    }
    let Some(cc) = c.caller() else {
        return Value::Nil;
    };
    match cc.take() {
        None => Value::Nil,
        Some(Panic::Exit(code)) => {
            cc.put_back(Panic::Exit(code));
            Value::Nil
        }
        Some(Panic::Target(v)) => v,
        Some(Panic::Runtime(e)) => bridge::runtime_error_value(&e.to_string()),
        Some(Panic::Plain(e)) => bridge::plain_error_value(&e.0),
    }
}
