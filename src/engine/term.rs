//! Structured terms exchanged with the worker
//!
//! `Term` stands in for the worker-native value codec. Every variant except
//! `Object` is an inherently transferable value; `Object` is a reference to a
//! host object held in the engine's registry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a registered host object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Structured value passed between host and worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// Empty value / empty list
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Symbolic constant
    Atom(String),
    /// Text
    Str(String),
    /// Ordered sequence
    List(Vec<Term>),
    /// Structure with a functor and arguments
    Compound {
        /// Functor name
        functor: String,
        /// Arguments
        args: Vec<Term>,
    },
    /// Unbound worker variable
    Var(String),
    /// Reference to a registered host object
    Object(ObjectId),
}

/// Discriminant of a [`Term`], used for operation overload resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermKind {
    /// `Term::Nil`
    Nil,
    /// `Term::Bool`
    Bool,
    /// `Term::Int`
    Int,
    /// `Term::Float`
    Float,
    /// `Term::Atom`
    Atom,
    /// `Term::Str`
    Str,
    /// `Term::List`
    List,
    /// `Term::Compound`
    Compound,
    /// `Term::Var`
    Var,
    /// `Term::Object`
    Object,
}

impl TermKind {
    /// Type name under which value-targeted operations are registered.
    pub fn type_name(self) -> &'static str {
        match self {
            TermKind::Nil => "nil",
            TermKind::Bool => "bool",
            TermKind::Int => "int",
            TermKind::Float => "float",
            TermKind::Atom => "atom",
            TermKind::Str => "string",
            TermKind::List => "list",
            TermKind::Compound => "compound",
            TermKind::Var => "var",
            TermKind::Object => "object",
        }
    }
}

impl Term {
    /// Build an atom.
    pub fn atom(name: impl Into<String>) -> Self {
        Term::Atom(name.into())
    }

    /// Build a string.
    pub fn string(text: impl Into<String>) -> Self {
        Term::Str(text.into())
    }

    /// Build a compound term.
    pub fn compound(functor: impl Into<String>, args: Vec<Term>) -> Self {
        Term::Compound {
            functor: functor.into(),
            args,
        }
    }

    /// Kind of this term.
    pub fn kind(&self) -> TermKind {
        match self {
            Term::Nil => TermKind::Nil,
            Term::Bool(_) => TermKind::Bool,
            Term::Int(_) => TermKind::Int,
            Term::Float(_) => TermKind::Float,
            Term::Atom(_) => TermKind::Atom,
            Term::Str(_) => TermKind::Str,
            Term::List(_) => TermKind::List,
            Term::Compound { .. } => TermKind::Compound,
            Term::Var(_) => TermKind::Var,
            Term::Object(_) => TermKind::Object,
        }
    }

    /// Integer value, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Numeric value, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Term::Int(value) => Some(*value as f64),
            Term::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Text of an atom or string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Term::Atom(text) | Term::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Elements of a list (`Nil` is the empty list).
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            Term::Nil => Some(&[]),
            _ => None,
        }
    }

    /// Object reference, if this is an `Object`.
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Term::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this term is the atom `name`.
    pub fn is_atom(&self, name: &str) -> bool {
        matches!(self, Term::Atom(atom) if atom == name)
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Int(value)
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Term::Float(value)
    }
}

impl From<bool> for Term {
    fn from(value: bool) -> Self {
        Term::Bool(value)
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::Str(value.to_string())
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Term::Str(value)
    }
}

impl From<Vec<Term>> for Term {
    fn from(items: Vec<Term>) -> Self {
        Term::List(items)
    }
}

impl From<ObjectId> for Term {
    fn from(id: ObjectId) -> Self {
        Term::Object(id)
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Nil => f.write_str("[]"),
            Term::Bool(value) => write!(f, "{}", value),
            Term::Int(value) => write!(f, "{}", value),
            Term::Float(value) => write!(f, "{:?}", value),
            Term::Atom(name) => f.write_str(name),
            Term::Str(text) => write!(f, "{:?}", text),
            Term::List(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Term::Compound { functor, args } => {
                write!(f, "{}(", functor)?;
                write_joined(f, args)?;
                f.write_str(")")
            }
            Term::Var(name) => f.write_str(name),
            Term::Object(id) => write!(f, "{}", id),
        }
    }
}
