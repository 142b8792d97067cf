use std::fmt;
use std::rc::Rc;

/// Coarse classification used in diagnostics and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Integer,
    Float,
    Array,
    Function,
    Procedure,
    Void,
    Null,
    Unknown,
}

/// Refinements of an integer word. They change casting rules, never storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntFlags {
    pub handle: bool,
    pub character: bool,
    pub boolean: bool,
}

impl IntFlags {
    pub const PLAIN: IntFlags = IntFlags {
        handle: false,
        character: false,
        boolean: false,
    };
    pub const HANDLE: IntFlags = IntFlags {
        handle: true,
        character: false,
        boolean: false,
    };
    pub const CHARACTER: IntFlags = IntFlags {
        handle: false,
        character: true,
        boolean: false,
    };
    pub const BOOLEAN: IntFlags = IntFlags {
        handle: false,
        character: false,
        boolean: true,
    };
}

/// Array descriptor.
///
/// `size` is the declared length: `N` for `T[N]`, `-1` for a reference
/// (`T[]`, length known only at runtime) and `0` for an open `T[..]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDesc {
    pub size: i64,
    pub contains: Type,
    pub is_big_number: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDesc {
    pub name: String,
    pub ty: Type,
    pub byref: bool,
    pub default: Option<ConstValue>,
}

/// Signature of a callable. Procedures return `Type::Void`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDesc {
    pub params: Vec<ParamDesc>,
    pub ret: Type,
}

impl FunctionDesc {
    pub fn returns_value(&self) -> bool {
        !matches!(self.ret, Type::Void)
    }

    /// Words reserved below the callee frame for the result.
    pub fn result_words(&self) -> i64 {
        if self.returns_value() { 1 } else { 0 }
    }

    /// Number of leading parameters without a default.
    pub fn required_params(&self) -> usize {
        self.params
            .iter()
            .position(|p| p.default.is_some())
            .unwrap_or(self.params.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Integer(IntFlags),
    Float,
    Array(Box<ArrayDesc>),
    Function(Rc<FunctionDesc>),
    Void,
    Null,
    Unknown,
}

impl Type {
    pub const INTEGER: Type = Type::Integer(IntFlags::PLAIN);
    pub const HANDLE: Type = Type::Integer(IntFlags::HANDLE);
    pub const CHARACTER: Type = Type::Integer(IntFlags::CHARACTER);
    pub const BOOLEAN: Type = Type::Integer(IntFlags::BOOLEAN);

    pub fn array_of(contains: Type, size: i64) -> Type {
        Type::Array(Box::new(ArrayDesc {
            size,
            contains,
            is_big_number: false,
        }))
    }

    pub fn string() -> Type {
        Type::array_of(Type::CHARACTER, -1)
    }

    pub fn big_number() -> Type {
        Type::Array(Box::new(ArrayDesc {
            size: -1,
            contains: Type::CHARACTER,
            is_big_number: true,
        }))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Type::Integer(_) => Kind::Integer,
            Type::Float => Kind::Float,
            Type::Array(_) => Kind::Array,
            Type::Function(f) if f.returns_value() => Kind::Function,
            Type::Function(_) => Kind::Procedure,
            Type::Void => Kind::Void,
            Type::Null => Kind::Null,
            Type::Unknown => Kind::Unknown,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Integer(_))
    }

    pub fn is_handle(&self) -> bool {
        matches!(self, Type::Integer(f) if f.handle)
    }

    /// Character array that is not a big number.
    pub fn is_string(&self) -> bool {
        match self {
            Type::Array(a) => !a.is_big_number && matches!(a.contains, Type::Integer(f) if f.character),
            _ => false,
        }
    }

    pub fn is_big_number(&self) -> bool {
        matches!(self, Type::Array(a) if a.is_big_number)
    }

    /// Strings and big numbers share the character-array representation.
    pub fn is_text(&self) -> bool {
        self.is_string() || self.is_big_number()
    }

    pub fn array(&self) -> Option<&ArrayDesc> {
        match self {
            Type::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<&Rc<FunctionDesc>> {
        match self {
            Type::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Whether a value of this type owns a heap reference that must be
    /// released when discarded.
    pub fn is_managed(&self) -> bool {
        self.is_array()
    }

    /// Element type when indexing a value of this type.
    pub fn element(&self) -> Option<&Type> {
        self.array().map(|a| &a.contains)
    }
}

/// Structural equality of kinds, recursing through arrays and signatures.
/// Integer flags and array sizes do not participate.
pub fn kinds_match(a: &Type, b: &Type) -> bool {
    match (a, b) {
        (Type::Integer(_), Type::Integer(_)) => true,
        (Type::Float, Type::Float) => true,
        (Type::Array(x), Type::Array(y)) => kinds_match(&x.contains, &y.contains),
        (Type::Function(x), Type::Function(y)) => signatures_match(x, y),
        (Type::Void, Type::Void) => true,
        (Type::Null, Type::Null) => true,
        (Type::Unknown, Type::Unknown) => true,
        _ => false,
    }
}

/// Two signatures are compatible when parameter count, passing mode and
/// kinds, and the return kind all agree.
pub fn signatures_match(a: &FunctionDesc, b: &FunctionDesc) -> bool {
    a.params.len() == b.params.len()
        && a
            .params
            .iter()
            .zip(&b.params)
            .all(|(x, y)| x.byref == y.byref && kinds_match(&x.ty, &y.ty))
        && kinds_match(&a.ret, &b.ret)
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Integer(flags) if flags.handle => write!(f, "handle"),
            Type::Integer(flags) if flags.character => write!(f, "character"),
            Type::Integer(flags) if flags.boolean => write!(f, "boolean"),
            Type::Integer(_) => write!(f, "integer"),
            Type::Float => write!(f, "float"),
            Type::Array(a) if a.is_big_number => write!(f, "bignumber"),
            t if t.is_string() => write!(f, "string"),
            Type::Array(a) if a.size > 0 => write!(f, "{}[{}]", a.contains, a.size),
            Type::Array(a) => write!(f, "{}[]", a.contains),
            Type::Function(desc) => {
                write!(f, "function(")?;
                for (i, p) in desc.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if p.byref {
                        write!(f, "ref ")?;
                    }
                    write!(f, "{}", p.ty)?;
                }
                write!(f, ")")?;
                if desc.returns_value() {
                    write!(f, ": {}", desc.ret)?;
                }
                Ok(())
            }
            Type::Void => write!(f, "void"),
            Type::Null => write!(f, "null"),
            Type::Unknown => write!(f, "unknown"),
        }
    }
}

/// A value known at compile time: constant declarations, parameter
/// defaults and block-level initializers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64, IntFlags),
    Float(f64),
    Str(String),
    BigNumber(String),
    Array(Vec<ConstValue>),
    /// A named function, taken as a value where it is used.
    Function(String),
    Null,
}

impl ConstValue {
    /// The type a constant has when nothing else is known.
    pub fn natural_type(&self) -> Type {
        match self {
            ConstValue::Int(_, flags) => Type::Integer(*flags),
            ConstValue::Float(_) => Type::Float,
            ConstValue::Str(_) => Type::string(),
            ConstValue::BigNumber(_) => Type::big_number(),
            ConstValue::Array(items) => {
                let contains = items
                    .first()
                    .map(ConstValue::natural_type)
                    .unwrap_or(Type::INTEGER);
                Type::array_of(contains, -1)
            }
            ConstValue::Function(_) => Type::Unknown,
            ConstValue::Null => Type::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(params: Vec<(Type, bool)>, ret: Type) -> FunctionDesc {
        FunctionDesc {
            params: params
                .into_iter()
                .enumerate()
                .map(|(i, (ty, byref))| ParamDesc {
                    name: format!("p{}", i),
                    ty,
                    byref,
                    default: None,
                })
                .collect(),
            ret,
        }
    }

    #[test]
    fn test_string_and_bignumber_are_text() {
        assert!(Type::string().is_string());
        assert!(!Type::string().is_big_number());
        assert!(Type::big_number().is_big_number());
        assert!(!Type::big_number().is_string());
        assert!(Type::big_number().is_text());
        assert!(!Type::array_of(Type::INTEGER, 4).is_text());
    }

    #[test]
    fn test_kinds_ignore_flags_and_sizes() {
        assert!(kinds_match(&Type::INTEGER, &Type::CHARACTER));
        assert!(kinds_match(
            &Type::array_of(Type::INTEGER, 10),
            &Type::array_of(Type::INTEGER, -1)
        ));
        assert!(!kinds_match(
            &Type::array_of(Type::INTEGER, 1),
            &Type::array_of(Type::Float, 1)
        ));
    }

    #[test]
    fn test_signatures_match_recursively() {
        let a = func(vec![(Type::INTEGER, false), (Type::string(), false)], Type::Float);
        let b = func(vec![(Type::BOOLEAN, false), (Type::string(), false)], Type::Float);
        assert!(signatures_match(&a, &b));

        let byref = func(vec![(Type::INTEGER, true), (Type::string(), false)], Type::Float);
        assert!(!signatures_match(&a, &byref));

        let ret = func(vec![(Type::INTEGER, false), (Type::string(), false)], Type::INTEGER);
        assert!(!signatures_match(&a, &ret));

        let inner = Rc::new(func(vec![(Type::INTEGER, false)], Type::INTEGER));
        let other = Rc::new(func(vec![(Type::Float, false)], Type::INTEGER));
        let x = func(vec![(Type::Function(inner), false)], Type::Void);
        let y = func(vec![(Type::Function(other), false)], Type::Void);
        assert!(!signatures_match(&x, &y));
    }

    #[test]
    fn test_required_params() {
        let mut f = func(vec![(Type::INTEGER, false), (Type::INTEGER, false)], Type::Void);
        assert_eq!(f.required_params(), 2);
        f.params[1].default = Some(ConstValue::Int(3, IntFlags::PLAIN));
        assert_eq!(f.required_params(), 1);
        assert_eq!(f.result_words(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::string().to_string(), "string");
        assert_eq!(Type::big_number().to_string(), "bignumber");
        assert_eq!(Type::array_of(Type::Float, 3).to_string(), "float[3]");
        assert_eq!(Type::array_of(Type::string(), -1).to_string(), "string[]");
        let f = func(vec![(Type::INTEGER, true)], Type::INTEGER);
        assert_eq!(
            Type::Function(Rc::new(f)).to_string(),
            "function(ref integer): integer"
        );
    }
}
