//! Source-language type model.
//!
//! Programs arrive fully type-checked, so this module only has to
//! *represent* types faithfully: identity, underlying resolution, and
//! the method-set queries the runtime needs for interface dispatch and
//! type-assertion diagnostics.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// Channel directionality. Runtime channel values are bidirectional;
/// the direction only constrains what a program may do with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanDir {
    Both,
    SendOnly,
    RecvOnly,
}

/// A struct field. Blank fields are named `"_"` and are skipped by
/// stores and equality.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Field { name: name.into(), ty }
    }

    pub fn is_blank(&self) -> bool {
        self.name == "_"
    }
}

/// A method in an interface or the declared method set of a named type.
#[derive(Debug, Clone)]
pub struct MethodSig {
    pub name: String,
    /// The method's function signature (receiver excluded).
    pub sig: Type,
}

/// A function signature.
#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<Type>,
    pub results: Vec<Type>,
    pub variadic: bool,
}

/// A named (declared) type. Identity is declaration identity: two
/// declarations with the same name and package are distinct types
/// ("types from different scopes" in assertion diagnostics).
#[derive(Debug)]
pub struct Named {
    pub name: String,
    pub pkg_path: String,
    underlying: OnceLock<Type>,
    methods: RwLock<Vec<MethodSig>>,
}

#[derive(Debug)]
pub enum TypeKind {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    Complex64,
    Complex128,
    String,
    Pointer(Type),
    Slice(Type),
    Array(Type, usize),
    Map(Type, Type),
    Chan(ChanDir, Type),
    Struct(Vec<Field>),
    Interface(Vec<MethodSig>),
    Func(Signature),
    Tuple(Vec<Type>),
    Named(Named),
}

/// A cheap-to-clone handle on a type. Named types compare by pointer;
/// everything else compares structurally.
#[derive(Clone)]
pub struct Type(Arc<TypeKind>);

macro_rules! basics {
    ($($fname:ident => $kind:ident),* $(,)?) => {
        $(pub fn $fname() -> Type {
            static T: OnceLock<Type> = OnceLock::new();
            T.get_or_init(|| Type(Arc::new(TypeKind::$kind))).clone()
        })*
    };
}

impl Type {
    pub fn new(kind: TypeKind) -> Type {
        Type(Arc::new(kind))
    }

    basics! {
        bool => Bool,
        int => Int,
        int8 => Int8,
        int16 => Int16,
        int32 => Int32,
        int64 => Int64,
        uint => Uint,
        uint8 => Uint8,
        uint16 => Uint16,
        uint32 => Uint32,
        uint64 => Uint64,
        uintptr => Uintptr,
        float32 => Float32,
        float64 => Float64,
        complex64 => Complex64,
        complex128 => Complex128,
        string => String,
    }

    pub fn pointer(elem: Type) -> Type {
        Type::new(TypeKind::Pointer(elem))
    }

    pub fn slice(elem: Type) -> Type {
        Type::new(TypeKind::Slice(elem))
    }

    pub fn array(elem: Type, len: usize) -> Type {
        Type::new(TypeKind::Array(elem, len))
    }

    pub fn map(key: Type, value: Type) -> Type {
        Type::new(TypeKind::Map(key, value))
    }

    pub fn chan(dir: ChanDir, elem: Type) -> Type {
        Type::new(TypeKind::Chan(dir, elem))
    }

    pub fn strukt(fields: Vec<Field>) -> Type {
        Type::new(TypeKind::Struct(fields))
    }

    pub fn interface(methods: Vec<MethodSig>) -> Type {
        Type::new(TypeKind::Interface(methods))
    }

    pub fn func(params: Vec<Type>, results: Vec<Type>, variadic: bool) -> Type {
        Type::new(TypeKind::Func(Signature { params, results, variadic }))
    }

    pub fn tuple(elems: Vec<Type>) -> Type {
        Type::new(TypeKind::Tuple(elems))
    }

    /// Declare a named type. The underlying type may be set later so
    /// recursive types can be built.
    pub fn named(name: impl Into<String>, pkg_path: impl Into<String>) -> Type {
        Type::new(TypeKind::Named(Named {
            name: name.into(),
            pkg_path: pkg_path.into(),
            underlying: OnceLock::new(),
            methods: RwLock::new(Vec::new()),
        }))
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0
    }

    pub fn set_underlying(&self, u: Type) {
        match self.kind() {
            TypeKind::Named(n) => {
                // Set-once; a second call on the same declaration is a
                // front-end bug.
                if n.underlying.set(u).is_err() {
                    panic!("underlying type of {} set twice", self);
                }
            }
            _ => panic!("set_underlying on unnamed type {}", self),
        }
    }

    pub fn add_method(&self, m: MethodSig) {
        match self.kind() {
            TypeKind::Named(n) => n.methods.write().push(m),
            _ => panic!("add_method on unnamed type {}", self),
        }
    }

    /// The declared method set of a named type; empty for others.
    pub fn declared_methods(&self) -> Vec<MethodSig> {
        match self.kind() {
            TypeKind::Named(n) => n.methods.read().clone(),
            _ => Vec::new(),
        }
    }

    pub fn name_and_path(&self) -> Option<(&str, &str)> {
        match self.kind() {
            TypeKind::Named(n) => Some((&n.name, &n.pkg_path)),
            _ => None,
        }
    }

    /// Resolve named chains down to a structural type.
    pub fn underlying(&self) -> Type {
        match self.kind() {
            TypeKind::Named(n) => n
                .underlying
                .get()
                .unwrap_or_else(|| panic!("underlying type of {} not set", self))
                .underlying(),
            _ => self.clone(),
        }
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.underlying().kind(), TypeKind::Interface(_))
    }

    pub fn is_named(&self) -> bool {
        matches!(self.kind(), TypeKind::Named(_))
    }

    /// Element type of pointers, slices, arrays and channels.
    pub fn elem(&self) -> Option<Type> {
        match self.underlying().kind() {
            TypeKind::Pointer(e) | TypeKind::Slice(e) | TypeKind::Chan(_, e) => Some(e.clone()),
            TypeKind::Array(e, _) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn struct_fields(&self) -> Option<Vec<Field>> {
        match self.underlying().kind() {
            TypeKind::Struct(fs) => Some(fs.clone()),
            _ => None,
        }
    }

    pub fn interface_methods(&self) -> Option<Vec<MethodSig>> {
        match self.underlying().kind() {
            TypeKind::Interface(ms) => Some(ms.clone()),
            _ => None,
        }
    }

    pub fn signature(&self) -> Option<Signature> {
        match self.underlying().kind() {
            TypeKind::Func(sig) => Some(sig.clone()),
            _ => None,
        }
    }

    /// A stable key for cache maps, derived from the allocation.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Type identity: pointer identity for named types, structural
    /// equality otherwise.
    pub fn identical(&self, other: &Type) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (self.kind(), other.kind()) {
            (TypeKind::Named(_), _) | (_, TypeKind::Named(_)) => false,
            (TypeKind::Bool, TypeKind::Bool)
            | (TypeKind::Int, TypeKind::Int)
            | (TypeKind::Int8, TypeKind::Int8)
            | (TypeKind::Int16, TypeKind::Int16)
            | (TypeKind::Int32, TypeKind::Int32)
            | (TypeKind::Int64, TypeKind::Int64)
            | (TypeKind::Uint, TypeKind::Uint)
            | (TypeKind::Uint8, TypeKind::Uint8)
            | (TypeKind::Uint16, TypeKind::Uint16)
            | (TypeKind::Uint32, TypeKind::Uint32)
            | (TypeKind::Uint64, TypeKind::Uint64)
            | (TypeKind::Uintptr, TypeKind::Uintptr)
            | (TypeKind::Float32, TypeKind::Float32)
            | (TypeKind::Float64, TypeKind::Float64)
            | (TypeKind::Complex64, TypeKind::Complex64)
            | (TypeKind::Complex128, TypeKind::Complex128)
            | (TypeKind::String, TypeKind::String) => true,
            (TypeKind::Pointer(a), TypeKind::Pointer(b)) => a.identical(b),
            (TypeKind::Slice(a), TypeKind::Slice(b)) => a.identical(b),
            (TypeKind::Array(a, n), TypeKind::Array(b, m)) => n == m && a.identical(b),
            (TypeKind::Map(ka, va), TypeKind::Map(kb, vb)) => {
                ka.identical(kb) && va.identical(vb)
            }
            (TypeKind::Chan(da, a), TypeKind::Chan(db, b)) => da == db && a.identical(b),
            (TypeKind::Struct(fa), TypeKind::Struct(fb)) => {
                fa.len() == fb.len()
                    && fa
                        .iter()
                        .zip(fb)
                        .all(|(x, y)| x.name == y.name && x.ty.identical(&y.ty))
            }
            (TypeKind::Interface(ma), TypeKind::Interface(mb)) => {
                ma.len() == mb.len()
                    && ma.iter().zip(mb).all(|(x, y)| x.name == y.name)
            }
            (TypeKind::Func(sa), TypeKind::Func(sb)) => {
                sa.variadic == sb.variadic
                    && sa.params.len() == sb.params.len()
                    && sa.results.len() == sb.results.len()
                    && sa.params.iter().zip(&sb.params).all(|(x, y)| x.identical(y))
                    && sa.results.iter().zip(&sb.results).all(|(x, y)| x.identical(y))
            }
            (TypeKind::Tuple(a), TypeKind::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.identical(y))
            }
            _ => false,
        }
    }

    /// First interface method this type's method set is missing, if any.
    /// Structural interfaces satisfy by subset; everything else by the
    /// declared method set of the named type.
    pub fn missing_method(&self, iface: &[MethodSig]) -> Option<String> {
        let have: Vec<MethodSig> = match self.underlying().kind() {
            TypeKind::Interface(ms) => ms.clone(),
            _ => {
                // Pointer receivers see the pointee's declared methods.
                let base = match self.kind() {
                    TypeKind::Pointer(e) => e.clone(),
                    _ => self.clone(),
                };
                base.declared_methods()
            }
        };
        for want in iface {
            let found = have.iter().any(|m| {
                m.name == want.name
                    && match (m.sig.signature(), want.sig.signature()) {
                        (Some(a), Some(b)) => a.params.len() == b.params.len(),
                        _ => true,
                    }
            });
            if !found {
                return Some(want.name.clone());
            }
        }
        None
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            TypeKind::Bool => write!(f, "bool"),
            TypeKind::Int => write!(f, "int"),
            TypeKind::Int8 => write!(f, "int8"),
            TypeKind::Int16 => write!(f, "int16"),
            TypeKind::Int32 => write!(f, "int32"),
            TypeKind::Int64 => write!(f, "int64"),
            TypeKind::Uint => write!(f, "uint"),
            TypeKind::Uint8 => write!(f, "uint8"),
            TypeKind::Uint16 => write!(f, "uint16"),
            TypeKind::Uint32 => write!(f, "uint32"),
            TypeKind::Uint64 => write!(f, "uint64"),
            TypeKind::Uintptr => write!(f, "uintptr"),
            TypeKind::Float32 => write!(f, "float32"),
            TypeKind::Float64 => write!(f, "float64"),
            TypeKind::Complex64 => write!(f, "complex64"),
            TypeKind::Complex128 => write!(f, "complex128"),
            TypeKind::String => write!(f, "string"),
            TypeKind::Pointer(e) => write!(f, "*{}", e),
            TypeKind::Slice(e) => write!(f, "[]{}", e),
            TypeKind::Array(e, n) => write!(f, "[{}]{}", n, e),
            TypeKind::Map(k, v) => write!(f, "map[{}]{}", k, v),
            TypeKind::Chan(ChanDir::Both, e) => write!(f, "chan {}", e),
            TypeKind::Chan(ChanDir::SendOnly, e) => write!(f, "chan<- {}", e),
            TypeKind::Chan(ChanDir::RecvOnly, e) => write!(f, "<-chan {}", e),
            TypeKind::Struct(fs) => {
                write!(f, "struct {{")?;
                for (i, fd) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{} {}", fd.name, fd.ty)?;
                }
                write!(f, "}}")
            }
            TypeKind::Interface(ms) => {
                if ms.is_empty() {
                    return write!(f, "interface {{}}");
                }
                write!(f, "interface {{")?;
                for (i, m) in ms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", m.name)?;
                }
                write!(f, "}}")
            }
            TypeKind::Func(sig) => {
                write!(f, "func(")?;
                for (i, p) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if sig.variadic && i == sig.params.len() - 1 {
                        write!(f, "...{}", p)?;
                    } else {
                        write!(f, "{}", p)?;
                    }
                }
                write!(f, ")")?;
                match sig.results.len() {
                    0 => Ok(()),
                    1 => write!(f, " {}", sig.results[0]),
                    _ => {
                        write!(f, " (")?;
                        for (i, r) in sig.results.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}", r)?;
                        }
                        write!(f, ")")
                    }
                }
            }
            TypeKind::Tuple(ts) => {
                write!(f, "(")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            TypeKind::Named(n) => {
                if n.pkg_path.is_empty() {
                    write!(f, "{}", n.name)
                } else {
                    write!(f, "{}.{}", n.pkg_path, n.name)
                }
            }
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_identity_is_declaration_identity() {
        let a = Type::named("T", "main");
        let b = Type::named("T", "main");
        a.set_underlying(Type::int());
        b.set_underlying(Type::int());
        assert!(a.identical(&a.clone()));
        assert!(!a.identical(&b));
    }

    #[test]
    fn structural_identity() {
        let a = Type::slice(Type::int());
        let b = Type::slice(Type::int());
        assert!(a.identical(&b));
        assert!(!a.identical(&Type::slice(Type::int8())));
        assert!(Type::map(Type::string(), Type::int())
            .identical(&Type::map(Type::string(), Type::int())));
    }

    #[test]
    fn underlying_resolves_named_chains() {
        let a = Type::named("A", "main");
        let b = Type::named("B", "main");
        b.set_underlying(Type::string());
        a.set_underlying(b.clone());
        assert!(matches!(a.underlying().kind(), TypeKind::String));
    }

    #[test]
    fn missing_method_reports_first_gap() {
        let t = Type::named("File", "main");
        t.set_underlying(Type::strukt(vec![]));
        t.add_method(MethodSig {
            name: "Read".into(),
            sig: Type::func(vec![Type::slice(Type::uint8())], vec![Type::int()], false),
        });
        let iface = vec![
            MethodSig {
                name: "Read".into(),
                sig: Type::func(vec![Type::slice(Type::uint8())], vec![Type::int()], false),
            },
            MethodSig {
                name: "Close".into(),
                sig: Type::func(vec![], vec![], false),
            },
        ];
        assert_eq!(t.missing_method(&iface), Some("Close".to_string()));
        assert_eq!(t.missing_method(&iface[..1]), None);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Type::slice(Type::uint8()).to_string(), "[]uint8");
        assert_eq!(
            Type::map(Type::string(), Type::pointer(Type::int())).to_string(),
            "map[string]*int"
        );
        let t = Type::named("Reader", "io");
        assert_eq!(t.to_string(), "io.Reader");
    }
}
