//! The boundary between interpreted and native code.
//!
//! [`Rtype`] is the host-side view of a type: the source type plus a
//! materialized method table. Native packages register their types and
//! functions through [`Package`] records; interpreted named types get
//! synthesized method tables whose entries are trampolines back into
//! the engine, so values produced by interpreted code present a valid
//! method set when handed to native callables.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{EvalResult, Panic};
use crate::interp::Interp;
use crate::types::Type;
use crate::value::{zero, Cell, FuncValue, GoStr, Value};

/// A native callable: zero results map to `Nil`, many to `Tuple`.
pub type NativeFn = dyn Fn(&Arc<Interp>, &[Value]) -> EvalResult<Value> + Send + Sync;

/// A registered native function with enough signature information to
/// marshal arguments.
pub struct HostFunc {
    pub name: String,
    /// Declared parameter types; nil arguments are replaced with the
    /// parameter's zero value. Empty means "pass through unchanged".
    pub params: Vec<Type>,
    pub variadic: bool,
    f: Box<NativeFn>,
}

impl HostFunc {
    pub fn new<F>(name: impl Into<String>, params: Vec<Type>, variadic: bool, f: F) -> Arc<HostFunc>
    where
        F: Fn(&Arc<Interp>, &[Value]) -> EvalResult<Value> + Send + Sync + 'static,
    {
        Arc::new(HostFunc { name: name.into(), params, variadic, f: Box::new(f) })
    }

    /// Invoke with nil-to-zero argument marshalling.
    pub fn call(&self, interp: &Arc<Interp>, args: &[Value]) -> EvalResult<Value> {
        if self.params.is_empty() {
            return (self.f)(interp, args);
        }
        let marshalled: Vec<Value> = args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                if matches!(a, Value::Nil) {
                    let pi = i.min(self.params.len() - 1);
                    zero(&self.params[pi])
                } else {
                    a.clone()
                }
            })
            .collect();
        (self.f)(interp, &marshalled)
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

#[derive(Clone)]
pub struct RtMethod {
    pub name: String,
    pub func: Arc<HostFunc>,
}

struct RtypeData {
    ty: Type,
    /// Declared in interpreted code (method bodies live in the
    /// program) rather than registered natively.
    local: bool,
    methods: RwLock<Vec<RtMethod>>,
}

/// A runtime type: identity-carrying handle used as the dynamic tag of
/// interface values and as a first-class `reflect`-style value.
#[derive(Clone)]
pub struct Rtype(Arc<RtypeData>);

impl Rtype {
    pub fn new(ty: Type, local: bool) -> Rtype {
        Rtype(Arc::new(RtypeData { ty, local, methods: RwLock::new(Vec::new()) }))
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }

    pub fn is_local(&self) -> bool {
        self.0.local
    }

    pub fn same(&self, other: &Rtype) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn add_method(&self, m: RtMethod) {
        self.0.methods.write().push(m);
    }

    pub fn methods(&self) -> Vec<RtMethod> {
        self.0.methods.read().clone()
    }

    pub fn method_by_name(&self, name: &str) -> Option<Arc<HostFunc>> {
        self.0
            .methods
            .read()
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.func.clone())
    }

    pub fn method_by_index(&self, i: usize) -> Option<RtMethod> {
        self.0.methods.read().get(i).cloned()
    }
}

impl fmt::Debug for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.ty)
    }
}

/// The bidirectional type cache. Lookups take the read lock; first
/// materializations take the write lock and run the caller-provided
/// synthesizer (the engine supplies trampolines for interpreted named
/// types there).
#[derive(Default)]
pub struct TypesRecord {
    cache: RwLock<FxHashMap<usize, Rtype>>,
}

impl TypesRecord {
    pub fn new() -> TypesRecord {
        TypesRecord::default()
    }

    pub fn lookup(&self, ty: &Type) -> Option<Rtype> {
        self.cache.read().get(&ty.key()).cloned()
    }

    pub fn to_rtype(&self, ty: &Type, make: impl FnOnce(&Type) -> Rtype) -> Rtype {
        if let Some(rt) = self.lookup(ty) {
            return rt;
        }
        let mut cache = self.cache.write();
        // Lost the race or first in: either way, settle under the
        // write lock so every caller sees one identity.
        cache
            .entry(ty.key())
            .or_insert_with(|| make(ty))
            .clone()
    }

    /// Reverse-map a runtime type back to a locally-declared named
    /// type, for dispatching interface calls to interpreted bodies.
    pub fn lookup_local(&self, rt: &Rtype) -> Option<Type> {
        rt.is_local().then(|| rt.ty().clone())
    }
}

/// Kind tag of an untyped constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntypedKind {
    Bool,
    Int,
    Rune,
    Float,
    Complex,
    Str,
}

/// An untyped constant: kind tag plus lossless literal text, read by
/// constant-folding front ends at compile time.
#[derive(Debug, Clone)]
pub struct UntypedConst {
    pub kind: UntypedKind,
    pub lit: String,
}

/// A named type registered by a native package: its type, which of its
/// methods are implemented in interpreted code vs natively, and the
/// native method bodies.
pub struct NamedTypeRec {
    pub ty: Type,
    pub interpreted_methods: Vec<String>,
    pub native_methods: Vec<String>,
    pub methods: FxHashMap<String, Arc<HostFunc>>,
}

/// The registration record an external package provides.
#[derive(Default)]
pub struct Package {
    pub name: String,
    pub path: String,
    pub deps: FxHashMap<String, String>,
    pub interfaces: FxHashMap<String, Type>,
    pub named_types: FxHashMap<String, NamedTypeRec>,
    pub alias_types: FxHashMap<String, Type>,
    pub vars: FxHashMap<String, Cell>,
    pub funcs: FxHashMap<String, Arc<HostFunc>>,
    pub typed_consts: FxHashMap<String, Value>,
    pub untyped_consts: FxHashMap<String, UntypedConst>,
}

impl Package {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Package {
        Package { name: name.into(), path: path.into(), ..Package::default() }
    }

    pub fn add_func(&mut self, f: Arc<HostFunc>) {
        self.funcs.insert(f.name.clone(), f);
    }

    pub fn add_var(&mut self, name: impl Into<String>, cell: Cell) {
        self.vars.insert(name.into(), cell);
    }

    pub fn add_named_type(&mut self, name: impl Into<String>, rec: NamedTypeRec) {
        self.named_types.insert(name.into(), rec);
    }
}

/// The capability the engine consumes: package lookup by path, and
/// resolution of a receiver type to its registered host type.
pub trait Loader: Send + Sync {
    fn installed(&self, path: &str) -> Option<Arc<Package>>;
    fn lookup_reflect(&self, ty: &Type) -> Option<Rtype>;
}

/// The standard [`Loader`]: a catalog of registered packages plus an
/// identity-preserving cache of their host types.
#[derive(Default)]
pub struct Registry {
    pkgs: RwLock<FxHashMap<String, Arc<Package>>>,
    rtypes: RwLock<FxHashMap<usize, Rtype>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&self, pkg: Package) {
        self.pkgs.write().insert(pkg.path.clone(), Arc::new(pkg));
    }
}

impl Loader for Registry {
    fn installed(&self, path: &str) -> Option<Arc<Package>> {
        self.pkgs.read().get(path).cloned()
    }

    fn lookup_reflect(&self, ty: &Type) -> Option<Rtype> {
        let base = match ty.kind() {
            crate::types::TypeKind::Pointer(e) => e.clone(),
            _ => ty.clone(),
        };
        let (name, path) = base.name_and_path()?;
        let pkg = self.installed(path)?;
        let rec = pkg.named_types.get(name)?;
        if let Some(rt) = self.rtypes.read().get(&base.key()) {
            return Some(rt.clone());
        }
        let mut cache = self.rtypes.write();
        let rt = cache.entry(base.key()).or_insert_with(|| {
            let rt = Rtype::new(base.clone(), false);
            for (mname, mf) in &rec.methods {
                rt.add_method(RtMethod { name: mname.clone(), func: mf.clone() });
            }
            rt
        });
        Some(rt.clone())
    }
}

/// `reflect.Type` helpers routed to when a method invocation's
/// receiver is a runtime type and the method is `Method` or
/// `MethodByName`.
pub fn reflect_method_helper(name: &str) -> Option<Arc<HostFunc>> {
    match name {
        "Method" => Some(method_by_index_func()),
        "MethodByName" => Some(method_by_name_func()),
        _ => None,
    }
}

fn method_by_index_func() -> Arc<HostFunc> {
    static F: OnceLock<Arc<HostFunc>> = OnceLock::new();
    F.get_or_init(|| {
        HostFunc::new("Method", vec![], false, |_, args| {
            let rt = as_rtype(&args[0])?;
            let i = args[1].as_index()? as usize;
            match rt.method_by_index(i) {
                Some(m) => Ok(Value::Func(FuncValue::Native(m.func))),
                None => Err(Panic::runtime(format!(
                    "method index {} out of range for {}",
                    i,
                    rt.ty()
                ))),
            }
        })
    })
    .clone()
}

fn method_by_name_func() -> Arc<HostFunc> {
    static F: OnceLock<Arc<HostFunc>> = OnceLock::new();
    F.get_or_init(|| {
        HostFunc::new("MethodByName", vec![], false, |_, args| {
            let rt = as_rtype(&args[0])?;
            let name = match &args[1] {
                Value::Str(s) => s.to_string(),
                other => return Err(Panic::plain(format!("MethodByName: not a string: {}", other))),
            };
            match rt.method_by_name(&name) {
                Some(f) => Ok(Value::tuple(vec![
                    Value::Func(FuncValue::Native(f)),
                    Value::Bool(true),
                ])),
                None => Ok(Value::tuple(vec![Value::Nil, Value::Bool(false)])),
            }
        })
    })
    .clone()
}

fn as_rtype(v: &Value) -> EvalResult<Rtype> {
    match v {
        Value::Rtype(rt) => Ok(rt.clone()),
        Value::Iface(i) => as_rtype(&i.val),
        other => Err(Panic::plain(format!("not a type: {}", other))),
    }
}

fn error_rtype(name: &str, path: &str) -> Rtype {
    let ty = Type::named(name, path);
    ty.set_underlying(Type::string());
    ty.add_method(crate::types::MethodSig {
        name: "Error".into(),
        sig: Type::func(vec![], vec![Type::string()], false),
    });
    let rt = Rtype::new(ty, false);
    rt.add_method(RtMethod {
        name: "Error".into(),
        func: HostFunc::new("Error", vec![], false, |_, args| {
            let msg = match &args[0] {
                Value::Iface(i) => i.val.clone(),
                other => (*other).clone(),
            };
            match msg {
                Value::Str(_) => Ok(msg),
                other => Ok(Value::str(other.to_string().as_str())),
            }
        }),
    });
    rt
}

/// The host type of runtime error values handed back by `recover`.
/// Its `Error` method yields the stored message, so interpreted code
/// can treat the payload as an error value.
pub fn runtime_error_rtype() -> Rtype {
    static RT: OnceLock<Rtype> = OnceLock::new();
    RT.get_or_init(|| error_rtype("Error", "runtime")).clone()
}

/// The host type of plain string errors.
pub fn plain_error_rtype() -> Rtype {
    static RT: OnceLock<Rtype> = OnceLock::new();
    RT.get_or_init(|| error_rtype("errorString", "errors")).clone()
}

/// Box a runtime error (message already carries its prefix) as an
/// error-shaped interface value.
pub fn runtime_error_value(msg: &str) -> Value {
    Value::iface(runtime_error_rtype(), Value::Str(GoStr::from(msg)))
}

/// Box a plain string error as an error-shaped interface value.
pub fn plain_error_value(msg: &str) -> Value {
    Value::iface(plain_error_rtype(), Value::Str(GoStr::from(msg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_record_single_identity() {
        let rec = TypesRecord::new();
        let ty = Type::named("T", "main");
        ty.set_underlying(Type::int());
        let a = rec.to_rtype(&ty, |t| Rtype::new(t.clone(), true));
        let b = rec.to_rtype(&ty, |t| Rtype::new(t.clone(), true));
        assert!(a.same(&b));
        assert!(rec.lookup_local(&a).is_some());
    }

    #[test]
    fn registry_resolves_receiver_types() {
        let reg = Registry::new();
        let ty = Type::named("Buf", "bytes");
        ty.set_underlying(Type::strukt(vec![]));
        let mut pkg = Package::new("bytes", "bytes");
        let mut methods = FxHashMap::default();
        methods.insert(
            "Len".to_string(),
            HostFunc::new("Len", vec![], false, |_, _| Ok(Value::Int(0))),
        );
        pkg.add_named_type(
            "Buf",
            NamedTypeRec {
                ty: ty.clone(),
                interpreted_methods: vec![],
                native_methods: vec!["Len".into()],
                methods,
            },
        );
        reg.register(pkg);
        let rt = reg.lookup_reflect(&ty).expect("registered type resolves");
        assert!(rt.method_by_name("Len").is_some());
        let again = reg.lookup_reflect(&Type::pointer(ty)).unwrap();
        assert!(rt.same(&again));
    }
}
