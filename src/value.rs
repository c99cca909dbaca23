//! The tagged runtime value.
//!
//! Every value knows its dynamic shape well enough to service
//! equality and type-assertion queries. Composites (slices, maps,
//! structs behind pointers, channels) share backing stores behind
//! `Arc`, so values may cross goroutine threads; arrays and structs
//! keep value semantics by deep-copying at load/store boundaries.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::{HostFunc, Rtype};
use crate::chan::ChanValue;
use crate::error::{EvalResult, Panic};
use crate::ssa::{Builtin, FuncId};
use crate::types::{Type, TypeKind};

/// A heap cell: the referent of a heap alloc, a local, or a global.
pub type Cell = Arc<Mutex<Value>>;

pub fn new_cell(v: Value) -> Cell {
    Arc::new(Mutex::new(v))
}

/// An immutable byte string. Source strings are byte slices: they may
/// hold invalid UTF-8, and indexing/slicing is byte-based.
#[derive(Clone)]
pub struct GoStr(Arc<[u8]>);

impl GoStr {
    pub fn empty() -> GoStr {
        GoStr(Arc::from(&b""[..]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn slice(&self, lo: usize, hi: usize) -> GoStr {
        GoStr(Arc::from(&self.0[lo..hi]))
    }
}

impl From<&str> for GoStr {
    fn from(s: &str) -> GoStr {
        GoStr(Arc::from(s.as_bytes()))
    }
}

impl From<&[u8]> for GoStr {
    fn from(b: &[u8]) -> GoStr {
        GoStr(Arc::from(b))
    }
}

impl From<Vec<u8>> for GoStr {
    fn from(b: Vec<u8>) -> GoStr {
        GoStr(Arc::from(b.into_boxed_slice()))
    }
}

impl PartialEq for GoStr {
    fn eq(&self, other: &GoStr) -> bool {
        self.0 == other.0
    }
}

impl Eq for GoStr {}

impl PartialOrd for GoStr {
    fn partial_cmp(&self, other: &GoStr) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GoStr {
    fn cmp(&self, other: &GoStr) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for GoStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for GoStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

// ── Places and composites ────────────────────────────────────────────

/// Where a pointer points: a standalone cell, or one element of a
/// shared backing store (slice element, array element, struct field).
#[derive(Clone)]
pub enum Place {
    Cell(Cell),
    Elem(Arc<Mutex<Vec<Value>>>, usize),
}

/// A non-nil pointer. The zero pointer is `Value::Nil`.
#[derive(Clone)]
pub struct Pointer {
    pub elem: Type,
    pub place: Place,
}

impl Pointer {
    pub fn cell(elem: Type, c: Cell) -> Pointer {
        Pointer { elem, place: Place::Cell(c) }
    }

    pub fn elem_at(elem: Type, arr: Arc<Mutex<Vec<Value>>>, idx: usize) -> Pointer {
        Pointer { elem, place: Place::Elem(arr, idx) }
    }

    /// Shallow view of the referent; shares composite backing stores.
    pub fn raw(&self) -> Value {
        match &self.place {
            Place::Cell(c) => c.lock().clone(),
            Place::Elem(arr, i) => arr.lock()[*i].clone(),
        }
    }

    /// Load with value semantics: arrays and structs detach.
    pub fn load(&self) -> Value {
        clone_for_store(&self.raw())
    }

    pub fn store(&self, v: Value) {
        let v = clone_for_store(&v);
        match &self.place {
            Place::Cell(c) => *c.lock() = v,
            Place::Elem(arr, i) => arr.lock()[*i] = v,
        }
    }

    /// Address identity.
    pub fn same(&self, other: &Pointer) -> bool {
        match (&self.place, &other.place) {
            (Place::Cell(a), Place::Cell(b)) => Arc::ptr_eq(a, b),
            (Place::Elem(a, i), Place::Elem(b, j)) => Arc::ptr_eq(a, b) && i == j,
            _ => false,
        }
    }
}

/// A slice: shared backing store plus offset/len/cap. The zero slice
/// keeps its element type and a nil flag so `len`, `append` and
/// comparison against nil behave.
#[derive(Clone)]
pub struct SliceValue {
    pub arr: Arc<Mutex<Vec<Value>>>,
    pub off: usize,
    pub len: usize,
    pub cap: usize,
    pub elem: Type,
    pub nil: bool,
}

impl SliceValue {
    pub fn from_vec(elem: Type, items: Vec<Value>) -> SliceValue {
        let len = items.len();
        SliceValue {
            arr: Arc::new(Mutex::new(items)),
            off: 0,
            len,
            cap: len,
            elem,
            nil: false,
        }
    }

    pub fn with_len_cap(elem: Type, len: usize, cap: usize) -> SliceValue {
        let mut items = Vec::with_capacity(cap);
        for _ in 0..cap {
            items.push(zero(&elem));
        }
        SliceValue {
            arr: Arc::new(Mutex::new(items)),
            off: 0,
            len,
            cap,
            elem,
            nil: false,
        }
    }

    pub fn nil_slice(elem: Type) -> SliceValue {
        SliceValue {
            arr: Arc::new(Mutex::new(Vec::new())),
            off: 0,
            len: 0,
            cap: 0,
            elem,
            nil: true,
        }
    }

    pub fn get(&self, i: usize) -> Value {
        clone_for_store(&self.arr.lock()[self.off + i])
    }

    pub fn set(&self, i: usize, v: Value) {
        self.arr.lock()[self.off + i] = clone_for_store(&v);
    }

    pub fn addr(&self, i: usize) -> Pointer {
        Pointer::elem_at(self.elem.clone(), self.arr.clone(), self.off + i)
    }

    /// Reslice sharing the backing store; bounds already validated.
    pub fn reslice(&self, lo: usize, hi: usize, max: usize) -> SliceValue {
        SliceValue {
            arr: self.arr.clone(),
            off: self.off + lo,
            len: hi - lo,
            cap: max - lo,
            elem: self.elem.clone(),
            nil: false,
        }
    }

    pub fn snapshot(&self) -> Vec<Value> {
        let arr = self.arr.lock();
        arr[self.off..self.off + self.len].to_vec()
    }
}

/// A fixed-size array. Value semantics are enforced at load/store
/// boundaries via [`clone_for_store`]; element addresses share the
/// backing store.
#[derive(Clone)]
pub struct ArrayValue {
    pub arr: Arc<Mutex<Vec<Value>>>,
    pub elem: Type,
}

impl ArrayValue {
    pub fn from_vec(elem: Type, items: Vec<Value>) -> ArrayValue {
        ArrayValue { arr: Arc::new(Mutex::new(items)), elem }
    }

    pub fn len(&self) -> usize {
        self.arr.lock().len()
    }

    pub fn deep_copy(&self) -> ArrayValue {
        let items = self.arr.lock().iter().map(clone_for_store).collect();
        ArrayValue { arr: Arc::new(Mutex::new(items)), elem: self.elem.clone() }
    }
}

/// An ordered-field struct. Carries its (possibly named) type for
/// field names, equality and method dispatch.
#[derive(Clone)]
pub struct StructValue {
    pub ty: Type,
    pub fields: Arc<Mutex<Vec<Value>>>,
}

impl StructValue {
    pub fn new(ty: Type, fields: Vec<Value>) -> StructValue {
        StructValue { ty, fields: Arc::new(Mutex::new(fields)) }
    }

    pub fn deep_copy(&self) -> StructValue {
        let fields = self.fields.lock().iter().map(clone_for_store).collect();
        StructValue { ty: self.ty.clone(), fields: Arc::new(Mutex::new(fields)) }
    }
}

/// An insertion-ordered map with source-rule key equality. Lookup and
/// update are linear scans, which also gives blank-field struct keys
/// the required identity-normalizing behavior.
#[derive(Clone)]
pub struct MapValue {
    pub key_ty: Type,
    pub val_ty: Type,
    entries: Arc<Mutex<Vec<(Value, Value)>>>,
    /// Key type is a struct containing a blank field.
    pub underscore_key: bool,
    pub nil: bool,
}

impl MapValue {
    pub fn new(key_ty: Type, val_ty: Type, underscore_key: bool) -> MapValue {
        MapValue {
            key_ty,
            val_ty,
            entries: Arc::new(Mutex::new(Vec::new())),
            underscore_key,
            nil: false,
        }
    }

    pub fn nil_map(key_ty: Type, val_ty: Type) -> MapValue {
        MapValue {
            key_ty,
            val_ty,
            entries: Arc::new(Mutex::new(Vec::new())),
            underscore_key: false,
            nil: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn get(&self, key: &Value) -> EvalResult<Option<Value>> {
        let entries = self.entries.lock();
        for (k, v) in entries.iter() {
            if equal_field(k, key)? {
                return Ok(Some(clone_for_store(v)));
            }
        }
        Ok(None)
    }

    /// Insert or replace. When an equal key already exists the stored
    /// key object is kept, so blank-field struct keys normalize to the
    /// first-inserted identity.
    pub fn insert(&self, key: Value, val: Value) -> EvalResult<()> {
        if self.nil {
            return Err(Panic::runtime("assignment to entry in nil map"));
        }
        let key = clone_for_store(&key);
        let val = clone_for_store(&val);
        let mut entries = self.entries.lock();
        for (k, v) in entries.iter_mut() {
            if equal_field(k, &key)? {
                *v = val;
                return Ok(());
            }
        }
        entries.push((key, val));
        Ok(())
    }

    pub fn remove(&self, key: &Value) -> EvalResult<()> {
        let mut entries = self.entries.lock();
        let mut found = None;
        for (i, (k, _)) in entries.iter().enumerate() {
            if equal_field(k, key)? {
                found = Some(i);
                break;
            }
        }
        if let Some(i) = found {
            entries.remove(i);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<(Value, Value)> {
        self.entries.lock().clone()
    }

    pub fn same(&self, other: &MapValue) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

/// An interpreted closure: compiled function plus captured bindings.
pub struct Closure {
    pub func: FuncId,
    pub env: Vec<Value>,
}

/// A callable value.
#[derive(Clone)]
pub enum FuncValue {
    /// A compiled function of the program.
    Compiled(FuncId),
    Closure(Arc<Closure>),
    Native(Arc<HostFunc>),
    Builtin(Builtin),
}

/// A non-nil interface value: dynamic type tag plus boxed payload.
/// The nil interface is `Value::Nil`.
#[derive(Clone)]
pub struct IfaceValue {
    pub rtype: Rtype,
    pub val: Value,
}

/// String range state: byte position scanning rune by rune.
pub struct StrIter {
    s: GoStr,
    pos: usize,
}

impl StrIter {
    pub fn new(s: GoStr) -> StrIter {
        StrIter { s, pos: 0 }
    }

    /// The (ok, byte index, rune) triple of a range step. Invalid
    /// bytes decode as U+FFFD advancing one byte.
    pub fn next(&mut self) -> (bool, i64, i32) {
        let b = self.s.as_bytes();
        if self.pos >= b.len() {
            return (false, 0, 0);
        }
        let (r, n) = decode_rune(&b[self.pos..]);
        let idx = self.pos as i64;
        self.pos += n;
        (true, idx, r)
    }
}

fn decode_rune(b: &[u8]) -> (i32, usize) {
    let max = b.len().min(4);
    for l in 1..=max {
        if let Ok(s) = std::str::from_utf8(&b[..l]) {
            if let Some(c) = s.chars().next() {
                return (c as i32, l);
            }
        }
    }
    (0xFFFD, 1)
}

/// Map range state over a snapshot of the entries.
pub struct MapIter {
    entries: Vec<(Value, Value)>,
    pos: usize,
}

impl MapIter {
    pub fn new(entries: Vec<(Value, Value)>) -> MapIter {
        MapIter { entries, pos: 0 }
    }

    pub fn next(&mut self) -> (bool, Value, Value) {
        if self.pos >= self.entries.len() {
            return (false, Value::Nil, Value::Nil);
        }
        let (k, v) = self.entries[self.pos].clone();
        self.pos += 1;
        (true, k, v)
    }
}

#[derive(Clone)]
pub enum IterValue {
    Str(Arc<Mutex<StrIter>>),
    Map(Arc<Mutex<MapIter>>),
}

// ── The value itself ─────────────────────────────────────────────────

#[derive(Clone)]
pub enum Value {
    /// The zero of every nilable kind, and the nil interface.
    Nil,
    Bool(bool),
    Int(i64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint(u64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Uintptr(u64),
    Float32(f32),
    Float64(f64),
    Complex64(f32, f32),
    Complex128(f64, f64),
    Str(GoStr),
    Pointer(Pointer),
    Slice(SliceValue),
    Array(ArrayValue),
    Map(MapValue),
    Chan(ChanValue),
    Struct(StructValue),
    Func(FuncValue),
    Iface(Box<IfaceValue>),
    /// A runtime type as a first-class value.
    Rtype(Rtype),
    /// Multi-result carrier.
    Tuple(Arc<[Value]>),
    /// Range iteration state.
    Iter(IterValue),
}

impl Value {
    pub fn str(s: impl Into<GoStr>) -> Value {
        Value::Str(s.into())
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Arc::from(items.into_boxed_slice()))
    }

    pub fn iface(rtype: Rtype, val: Value) -> Value {
        Value::Iface(Box::new(IfaceValue { rtype, val }))
    }

    /// Whether this value compares equal to the untyped nil.
    pub fn is_nil(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::Slice(s) => s.nil,
            Value::Map(m) => m.nil,
            _ => false,
        }
    }

    /// An integer usable as an index, length or size.
    pub fn as_index(&self) -> EvalResult<i64> {
        match self {
            Value::Int(i) | Value::Int64(i) => Ok(*i),
            Value::Int8(i) => Ok(*i as i64),
            Value::Int16(i) => Ok(*i as i64),
            Value::Int32(i) => Ok(*i as i64),
            Value::Uint(u) | Value::Uint64(u) | Value::Uintptr(u) => Ok(*u as i64),
            Value::Uint8(u) => Ok(*u as i64),
            Value::Uint16(u) => Ok(*u as i64),
            Value::Uint32(u) => Ok(*u as i64),
            _ => Err(Panic::plain(format!("cannot use {} as integer", self.kind_name()))),
        }
    }

    /// Widen to the widest type of the value's category: bool, int64,
    /// uint64, float64, complex128 or string.
    pub fn widen(&self) -> Value {
        match self {
            Value::Bool(_)
            | Value::Int64(_)
            | Value::Uint64(_)
            | Value::Float64(_)
            | Value::Complex128(..)
            | Value::Str(_) => self.clone(),
            Value::Int(i) => Value::Int64(*i),
            Value::Int8(i) => Value::Int64(*i as i64),
            Value::Int16(i) => Value::Int64(*i as i64),
            Value::Int32(i) => Value::Int64(*i as i64),
            Value::Uint(u) | Value::Uintptr(u) => Value::Uint64(*u),
            Value::Uint8(u) => Value::Uint64(*u as u64),
            Value::Uint16(u) => Value::Uint64(*u as u64),
            Value::Uint32(u) => Value::Uint64(*u as u64),
            Value::Float32(f) => Value::Float64(*f as f64),
            Value::Complex64(re, im) => Value::Complex128(*re as f64, *im as f64),
            _ => panic!("cannot widen {}", self.kind_name()),
        }
    }

    /// Rebuild a widened value in the kind of `like`. Inverse of
    /// [`Value::widen`] within a numeric category.
    pub fn narrow(wide: &Value, like: &Value) -> Value {
        match (like, wide) {
            (Value::Bool(_), Value::Bool(b)) => Value::Bool(*b),
            (Value::Str(_), Value::Str(s)) => Value::Str(s.clone()),
            (Value::Int(_), Value::Int64(i)) => Value::Int(*i),
            (Value::Int8(_), Value::Int64(i)) => Value::Int8(*i as i8),
            (Value::Int16(_), Value::Int64(i)) => Value::Int16(*i as i16),
            (Value::Int32(_), Value::Int64(i)) => Value::Int32(*i as i32),
            (Value::Int64(_), Value::Int64(i)) => Value::Int64(*i),
            (Value::Uint(_), Value::Uint64(u)) => Value::Uint(*u),
            (Value::Uint8(_), Value::Uint64(u)) => Value::Uint8(*u as u8),
            (Value::Uint16(_), Value::Uint64(u)) => Value::Uint16(*u as u16),
            (Value::Uint32(_), Value::Uint64(u)) => Value::Uint32(*u as u32),
            (Value::Uint64(_), Value::Uint64(u)) => Value::Uint64(*u),
            (Value::Uintptr(_), Value::Uint64(u)) => Value::Uintptr(*u),
            (Value::Float32(_), Value::Float64(f)) => Value::Float32(*f as f32),
            (Value::Float64(_), Value::Float64(f)) => Value::Float64(*f),
            (Value::Complex64(..), Value::Complex128(re, im)) => {
                Value::Complex64(*re as f32, *im as f32)
            }
            (Value::Complex128(..), Value::Complex128(re, im)) => Value::Complex128(*re, *im),
            _ => panic!(
                "cannot narrow {} into {}",
                wide.kind_name(),
                like.kind_name()
            ),
        }
    }

    /// A short name of the dynamic shape, for fault messages.
    pub fn kind_name(&self) -> String {
        match self {
            Value::Nil => "nil".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Int8(_) => "int8".into(),
            Value::Int16(_) => "int16".into(),
            Value::Int32(_) => "int32".into(),
            Value::Int64(_) => "int64".into(),
            Value::Uint(_) => "uint".into(),
            Value::Uint8(_) => "uint8".into(),
            Value::Uint16(_) => "uint16".into(),
            Value::Uint32(_) => "uint32".into(),
            Value::Uint64(_) => "uint64".into(),
            Value::Uintptr(_) => "uintptr".into(),
            Value::Float32(_) => "float32".into(),
            Value::Float64(_) => "float64".into(),
            Value::Complex64(..) => "complex64".into(),
            Value::Complex128(..) => "complex128".into(),
            Value::Str(_) => "string".into(),
            Value::Pointer(p) => format!("*{}", p.elem),
            Value::Slice(s) => format!("[]{}", s.elem),
            Value::Array(a) => format!("[{}]{}", a.len(), a.elem),
            Value::Map(m) => format!("map[{}]{}", m.key_ty, m.val_ty),
            Value::Chan(c) => format!("chan {}", c.elem()),
            Value::Struct(s) => s.ty.to_string(),
            Value::Func(_) => "func".into(),
            Value::Iface(i) => i.rtype.ty().to_string(),
            Value::Rtype(_) => "type".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Iter(_) => "iter".into(),
        }
    }
}

/// Copy for assignment: arrays and structs detach, everything else is
/// a shallow handle clone.
pub fn clone_for_store(v: &Value) -> Value {
    match v {
        Value::Array(a) => Value::Array(a.deep_copy()),
        Value::Struct(s) => Value::Struct(s.deep_copy()),
        _ => v.clone(),
    }
}

/// The zero value of a type.
pub fn zero(ty: &Type) -> Value {
    match ty.underlying().kind() {
        TypeKind::Bool => Value::Bool(false),
        TypeKind::Int => Value::Int(0),
        TypeKind::Int8 => Value::Int8(0),
        TypeKind::Int16 => Value::Int16(0),
        TypeKind::Int32 => Value::Int32(0),
        TypeKind::Int64 => Value::Int64(0),
        TypeKind::Uint => Value::Uint(0),
        TypeKind::Uint8 => Value::Uint8(0),
        TypeKind::Uint16 => Value::Uint16(0),
        TypeKind::Uint32 => Value::Uint32(0),
        TypeKind::Uint64 => Value::Uint64(0),
        TypeKind::Uintptr => Value::Uintptr(0),
        TypeKind::Float32 => Value::Float32(0.0),
        TypeKind::Float64 => Value::Float64(0.0),
        TypeKind::Complex64 => Value::Complex64(0.0, 0.0),
        TypeKind::Complex128 => Value::Complex128(0.0, 0.0),
        TypeKind::String => Value::Str(GoStr::empty()),
        TypeKind::Pointer(_)
        | TypeKind::Chan(..)
        | TypeKind::Func(_)
        | TypeKind::Interface(_) => Value::Nil,
        TypeKind::Slice(e) => Value::Slice(SliceValue::nil_slice(e.clone())),
        TypeKind::Map(k, v) => Value::Map(MapValue::nil_map(k.clone(), v.clone())),
        TypeKind::Array(e, n) => {
            let items = (0..*n).map(|_| zero(e)).collect();
            Value::Array(ArrayValue::from_vec(e.clone(), items))
        }
        TypeKind::Struct(fields) => {
            let vals = fields.iter().map(|f| zero(&f.ty)).collect();
            // Keep the declared (possibly named) type on the value.
            Value::Struct(StructValue::new(ty.clone(), vals))
        }
        TypeKind::Tuple(ts) => Value::tuple(ts.iter().map(zero).collect()),
        TypeKind::Named(_) => unreachable!("underlying resolved above"),
    }
}

// ── Equality ─────────────────────────────────────────────────────────

/// Source-rule equality. Channels compare by identity, pointers by
/// address, structs field-wise ignoring blank fields, arrays
/// element-wise; slices, maps and functions are uncomparable except
/// against nil (handled by the caller via [`Value::is_nil`]).
pub fn equal_values(x: &Value, y: &Value) -> EvalResult<bool> {
    match (x, y) {
        (Value::Nil, _) => Ok(y.is_nil()),
        (_, Value::Nil) => Ok(x.is_nil()),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Int(a), Value::Int(b)) => Ok(a == b),
        (Value::Int8(a), Value::Int8(b)) => Ok(a == b),
        (Value::Int16(a), Value::Int16(b)) => Ok(a == b),
        (Value::Int32(a), Value::Int32(b)) => Ok(a == b),
        (Value::Int64(a), Value::Int64(b)) => Ok(a == b),
        (Value::Uint(a), Value::Uint(b)) => Ok(a == b),
        (Value::Uint8(a), Value::Uint8(b)) => Ok(a == b),
        (Value::Uint16(a), Value::Uint16(b)) => Ok(a == b),
        (Value::Uint32(a), Value::Uint32(b)) => Ok(a == b),
        (Value::Uint64(a), Value::Uint64(b)) => Ok(a == b),
        (Value::Uintptr(a), Value::Uintptr(b)) => Ok(a == b),
        (Value::Float32(a), Value::Float32(b)) => Ok(a == b),
        (Value::Float64(a), Value::Float64(b)) => Ok(a == b),
        (Value::Complex64(ar, ai), Value::Complex64(br, bi)) => Ok(ar == br && ai == bi),
        (Value::Complex128(ar, ai), Value::Complex128(br, bi)) => Ok(ar == br && ai == bi),
        (Value::Str(a), Value::Str(b)) => Ok(a == b),
        (Value::Pointer(a), Value::Pointer(b)) => Ok(a.same(b)),
        (Value::Chan(a), Value::Chan(b)) => Ok(a.same(b)),
        (Value::Struct(a), Value::Struct(b)) => equal_structs(a, b),
        (Value::Array(a), Value::Array(b)) => {
            let av = a.arr.lock().clone();
            let bv = b.arr.lock().clone();
            if av.len() != bv.len() {
                return Ok(false);
            }
            for (ea, eb) in av.iter().zip(&bv) {
                if !equal_field(ea, eb)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::Iface(a), Value::Iface(b)) => {
            if !a.rtype.ty().identical(b.rtype.ty()) {
                return Ok(false);
            }
            equal_field(&a.val, &b.val)
        }
        (Value::Rtype(a), Value::Rtype(b)) => Ok(a.same(b)),
        (Value::Slice(s), Value::Slice(_)) => Err(Panic::runtime(format!(
            "comparing uncomparable type []{}",
            s.elem
        ))),
        (Value::Map(m), Value::Map(_)) => Err(Panic::runtime(format!(
            "comparing uncomparable type map[{}]{}",
            m.key_ty, m.val_ty
        ))),
        (Value::Func(_), Value::Func(_)) => {
            Err(Panic::runtime("comparing uncomparable type func".to_string()))
        }
        _ => Ok(false),
    }
}

/// Equality inside composites: nilable members compare by nil-ness
/// first, so struct fields holding slices or maps do not fault when
/// both sides are nil.
fn equal_field(x: &Value, y: &Value) -> EvalResult<bool> {
    if x.is_nil() || y.is_nil() {
        return Ok(x.is_nil() && y.is_nil());
    }
    equal_values(x, y)
}

fn equal_structs(a: &StructValue, b: &StructValue) -> EvalResult<bool> {
    if !a.ty.identical(&b.ty) {
        return Ok(false);
    }
    let fields = a.ty.struct_fields().unwrap_or_default();
    let av = a.fields.lock().clone();
    let bv = b.fields.lock().clone();
    for (i, f) in fields.iter().enumerate() {
        if f.is_blank() {
            continue;
        }
        if !equal_field(&av[i], &bv[i])? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn fmt_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v == (v as i64) as f64 && v.abs() < 1e15 {
        write!(f, "{}", v as i64)
    } else {
        write!(f, "{}", v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "<nil>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Int8(i) => write!(f, "{}", i),
            Value::Int16(i) => write!(f, "{}", i),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Uint(u) => write!(f, "{}", u),
            Value::Uint8(u) => write!(f, "{}", u),
            Value::Uint16(u) => write!(f, "{}", u),
            Value::Uint32(u) => write!(f, "{}", u),
            Value::Uint64(u) => write!(f, "{}", u),
            Value::Uintptr(u) => write!(f, "{}", u),
            Value::Float32(x) => fmt_float(f, *x as f64),
            Value::Float64(x) => fmt_float(f, *x),
            Value::Complex64(re, im) => write!(f, "({}+{}i)", re, im),
            Value::Complex128(re, im) => write!(f, "({}+{}i)", re, im),
            Value::Str(s) => write!(f, "{}", s),
            Value::Pointer(p) => write!(f, "&{}", p.raw()),
            Value::Slice(s) => {
                if s.nil {
                    return write!(f, "[]");
                }
                write!(f, "[")?;
                for (i, v) in s.snapshot().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.arr.lock().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "map[")?;
                for (i, (k, v)) in m.snapshot().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                write!(f, "]")
            }
            Value::Chan(_) => write!(f, "chan"),
            Value::Struct(s) => {
                write!(f, "{{")?;
                for (i, v) in s.fields.lock().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
            Value::Func(_) => write!(f, "func"),
            Value::Iface(i) => write!(f, "{}", i.val),
            Value::Rtype(rt) => write!(f, "{}", rt.ty()),
            Value::Tuple(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            Value::Iter(_) => write!(f, "iter"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            _ => write!(f, "{}", self),
        }
    }
}
