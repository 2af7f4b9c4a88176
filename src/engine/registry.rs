//! Host object table and callback operation catalog
//!
//! Host values that cannot cross the structured channel are registered here
//! and referred to by [`ObjectId`]. Operations are registered per type name
//! with a parameter signature; worker callbacks are resolved against that
//! catalog, most specific overload first.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Engine;
use super::error::{CallbackError, CallbackResult};
use super::protocol::{CallbackOutcomePayload, CallbackRequestPayload, Target};
use super::term::{ObjectId, Term, TermKind};

/// Shared handle to a registered host value
pub type HostObject = Arc<dyn Any + Send + Sync>;

/// Handler executed for a resolved callback
pub type OperationHandler =
    Arc<dyn Fn(&mut Invocation<'_>) -> CallbackResult<Returned> + Send + Sync>;

/// Declared parameter kind of an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Any term or object
    Any,
    /// Any registered object
    AnyObject,
    /// A registered object of the named type
    Object(String),
    /// Integer or float
    Number,
    /// Integer
    Int,
    /// Float (integers widen)
    Float,
    /// Atom or string
    Text,
    /// Atom
    Atom,
    /// String
    Str,
    /// Boolean
    Bool,
    /// List (including the empty list)
    List,
    /// Compound term
    Compound,
}

impl ParamType {
    fn matches_exactly(&self, arg: &Arg) -> bool {
        match (self, arg) {
            (ParamType::Object(expected), Arg::Object { type_name, .. }) => expected == type_name,
            (ParamType::Int, Arg::Term(term)) => term.kind() == TermKind::Int,
            (ParamType::Float, Arg::Term(term)) => term.kind() == TermKind::Float,
            (ParamType::Atom, Arg::Term(term)) => term.kind() == TermKind::Atom,
            (ParamType::Str, Arg::Term(term)) => term.kind() == TermKind::Str,
            (ParamType::Bool, Arg::Term(term)) => term.kind() == TermKind::Bool,
            (ParamType::List, Arg::Term(term)) => {
                matches!(term.kind(), TermKind::List | TermKind::Nil)
            }
            (ParamType::Compound, Arg::Term(term)) => term.kind() == TermKind::Compound,
            _ => false,
        }
    }

    fn accepts(&self, arg: &Arg) -> bool {
        if self.matches_exactly(arg) {
            return true;
        }
        match (self, arg) {
            (ParamType::Any, _) => true,
            (ParamType::AnyObject, Arg::Object { .. }) => true,
            (ParamType::Number, Arg::Term(term)) => {
                matches!(term.kind(), TermKind::Int | TermKind::Float)
            }
            (ParamType::Float, Arg::Term(term)) => term.kind() == TermKind::Int,
            (ParamType::Text, Arg::Term(term)) => {
                matches!(term.kind(), TermKind::Atom | TermKind::Str)
            }
            _ => false,
        }
    }

    /// Whether every value accepted by `self` is also accepted by `other`.
    fn assignable_to(&self, other: &ParamType) -> bool {
        if self == other {
            return true;
        }
        matches!(
            (self, other),
            (_, ParamType::Any)
                | (ParamType::Object(_), ParamType::AnyObject)
                | (ParamType::Int | ParamType::Float, ParamType::Number)
                | (ParamType::Int, ParamType::Float)
                | (ParamType::Atom | ParamType::Str, ParamType::Text)
        )
    }
}

/// Argument of a callback after object references are resolved
#[derive(Clone)]
pub enum Arg {
    /// Plain term
    Term(Term),
    /// Registered host object
    Object {
        /// Object id
        id: ObjectId,
        /// Registered type name
        type_name: String,
        /// Object handle
        object: HostObject,
    },
}

impl Arg {
    /// Wire form of this argument.
    pub fn to_term(&self) -> Term {
        match self {
            Arg::Term(term) => term.clone(),
            Arg::Object { id, .. } => Term::Object(*id),
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Term(term) => write!(f, "Term({})", term),
            Arg::Object { id, type_name, .. } => write!(f, "Object({} : {})", id, type_name),
        }
    }
}

/// Receiver of a callback
#[derive(Clone)]
pub enum Receiver {
    /// Static operation
    None,
    /// Registered host object
    Object {
        /// Object id
        id: ObjectId,
        /// Object handle
        object: HostObject,
    },
    /// Plain value
    Value(Term),
}

/// What a handler hands back to the worker
pub enum Returned {
    /// No value
    Nothing,
    /// A transferable term
    Value(Term),
    /// A host value; registered and sent as a reference
    Object {
        /// Type name to register under
        type_name: String,
        /// The value
        object: HostObject,
    },
}

impl From<Term> for Returned {
    fn from(term: Term) -> Self {
        Returned::Value(term)
    }
}

/// Context handed to an operation handler
pub struct Invocation<'a> {
    engine: Option<&'a Engine>,
    registry: &'a HostRegistry,
    /// Receiver of the call
    pub receiver: Receiver,
    /// Arguments; updates are visible to the worker when it asked for an echo
    pub args: Vec<Arg>,
}

impl<'a> Invocation<'a> {
    /// Engine the callback arrived on; handlers use it for nested goals.
    pub fn engine(&self) -> CallbackResult<&'a Engine> {
        self.engine
            .ok_or_else(|| CallbackError::Failed("no engine bound to this invocation".to_string()))
    }

    /// Registry the callback was resolved against.
    pub fn registry(&self) -> &'a HostRegistry {
        self.registry
    }

    /// Receiver downcast to a concrete host type.
    pub fn receiver_as<T: Any + Send + Sync>(&self) -> CallbackResult<Arc<T>> {
        match &self.receiver {
            Receiver::Object { id, object } => object.clone().downcast::<T>().map_err(|_| {
                CallbackError::TypeMismatch(format!("receiver {} has an unexpected type", id))
            }),
            Receiver::Value(term) => Err(CallbackError::TypeMismatch(format!(
                "receiver {} is not a host object",
                term
            ))),
            Receiver::None => Err(CallbackError::TypeMismatch(
                "static operation has no receiver".to_string(),
            )),
        }
    }

    /// Receiver as a plain term.
    pub fn receiver_term(&self) -> CallbackResult<&Term> {
        match &self.receiver {
            Receiver::Value(term) => Ok(term),
            _ => Err(CallbackError::TypeMismatch(
                "receiver is not a plain value".to_string(),
            )),
        }
    }

    /// Argument `index` as a term.
    pub fn term(&self, index: usize) -> CallbackResult<&Term> {
        match self.args.get(index) {
            Some(Arg::Term(term)) => Ok(term),
            Some(Arg::Object { id, .. }) => Err(CallbackError::TypeMismatch(format!(
                "argument {} is object {}",
                index, id
            ))),
            None => Err(CallbackError::TypeMismatch(format!(
                "missing argument {}",
                index
            ))),
        }
    }

    /// Argument `index` as an integer.
    pub fn int(&self, index: usize) -> CallbackResult<i64> {
        let term = self.term(index)?;
        term.as_int().ok_or_else(|| {
            CallbackError::TypeMismatch(format!("argument {} is not an integer: {}", index, term))
        })
    }

    /// Argument `index` as a float; integers widen.
    pub fn float(&self, index: usize) -> CallbackResult<f64> {
        let term = self.term(index)?;
        term.as_f64().ok_or_else(|| {
            CallbackError::TypeMismatch(format!("argument {} is not a number: {}", index, term))
        })
    }

    /// Argument `index` as text (atom or string).
    pub fn text(&self, index: usize) -> CallbackResult<&str> {
        let term = self.term(index)?;
        term.as_text().ok_or_else(|| {
            CallbackError::TypeMismatch(format!("argument {} is not text: {}", index, term))
        })
    }

    /// Argument `index` downcast to a concrete host type.
    pub fn object<T: Any + Send + Sync>(&self, index: usize) -> CallbackResult<Arc<T>> {
        match self.args.get(index) {
            Some(Arg::Object { id, object, .. }) => {
                object.clone().downcast::<T>().map_err(|_| {
                    CallbackError::TypeMismatch(format!("object {} has an unexpected type", id))
                })
            }
            Some(Arg::Term(term)) => Err(CallbackError::TypeMismatch(format!(
                "argument {} is not an object: {}",
                index, term
            ))),
            None => Err(CallbackError::TypeMismatch(format!(
                "missing argument {}",
                index
            ))),
        }
    }

    /// Replace argument `index`, for workers that asked for echoed arguments.
    pub fn set_arg(&mut self, index: usize, term: Term) -> CallbackResult<()> {
        let slot = self
            .args
            .get_mut(index)
            .ok_or_else(|| CallbackError::TypeMismatch(format!("missing argument {}", index)))?;
        *slot = Arg::Term(term);
        Ok(())
    }
}

#[derive(Clone)]
struct Operation {
    params: Vec<ParamType>,
    handler: OperationHandler,
}

#[derive(Clone)]
struct ObjectEntry {
    type_name: String,
    object: HostObject,
}

/// Objects and operations reachable from worker callbacks
pub struct HostRegistry {
    objects: RwLock<HashMap<ObjectId, ObjectEntry>>,
    operations: RwLock<HashMap<String, HashMap<String, Vec<Operation>>>>,
    next_object: AtomicU64,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("objects", &self.objects.read().len())
            .field("types", &self.operations.read().len())
            .finish()
    }
}

impl HostRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            next_object: AtomicU64::new(1),
        }
    }

    /// Register a host value and return the reference the worker will see.
    pub fn register_object<T>(&self, type_name: impl Into<String>, value: T) -> ObjectId
    where
        T: Any + Send + Sync,
    {
        self.register_shared(type_name, Arc::new(value))
    }

    /// Register an already shared host value.
    pub fn register_shared(&self, type_name: impl Into<String>, object: HostObject) -> ObjectId {
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        self.objects.write().insert(
            id,
            ObjectEntry {
                type_name: type_name.into(),
                object,
            },
        );
        id
    }

    /// Drop a registration. Returns `false` if the id was unknown.
    pub fn unregister(&self, id: ObjectId) -> bool {
        self.objects.write().remove(&id).is_some()
    }

    /// Type name and handle of a registered object.
    pub fn lookup(&self, id: ObjectId) -> Option<(String, HostObject)> {
        self.objects
            .read()
            .get(&id)
            .map(|entry| (entry.type_name.clone(), entry.object.clone()))
    }

    /// Registered object downcast to a concrete type.
    pub fn object<T: Any + Send + Sync>(&self, id: ObjectId) -> Option<Arc<T>> {
        let (_, object) = self.lookup(id)?;
        object.downcast::<T>().ok()
    }

    /// Number of live object registrations.
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Register an operation overload. A second registration with the same
    /// signature replaces the first.
    pub fn register_operation<F>(
        &self,
        type_name: impl Into<String>,
        operation: impl Into<String>,
        params: Vec<ParamType>,
        handler: F,
    ) where
        F: Fn(&mut Invocation<'_>) -> CallbackResult<Returned> + Send + Sync + 'static,
    {
        let mut operations = self.operations.write();
        let overloads = operations
            .entry(type_name.into())
            .or_default()
            .entry(operation.into())
            .or_default();
        overloads.retain(|existing| existing.params != params);
        overloads.push(Operation {
            params,
            handler: Arc::new(handler),
        });
    }

    /// Whether any operation is registered for `type_name`.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.operations.read().contains_key(type_name)
    }

    fn resolve(
        &self,
        type_name: &str,
        operation: &str,
        args: &[Arg],
    ) -> CallbackResult<OperationHandler> {
        let operations = self.operations.read();
        let by_name = operations
            .get(type_name)
            .ok_or_else(|| CallbackError::UnknownType(type_name.to_string()))?;
        let no_such = || CallbackError::NoSuchOperation {
            type_name: type_name.to_string(),
            operation: operation.to_string(),
            arity: args.len(),
        };
        let overloads = by_name.get(operation).ok_or_else(no_such)?;

        let same_arity: Vec<&Operation> = overloads
            .iter()
            .filter(|candidate| candidate.params.len() == args.len())
            .collect();

        let exact: Vec<&Operation> = same_arity
            .iter()
            .copied()
            .filter(|candidate| {
                candidate
                    .params
                    .iter()
                    .zip(args)
                    .all(|(param, arg)| param.matches_exactly(arg))
            })
            .collect();
        if exact.len() == 1 {
            return Ok(exact[0].handler.clone());
        }

        let compatible: Vec<&Operation> = same_arity
            .into_iter()
            .filter(|candidate| {
                candidate
                    .params
                    .iter()
                    .zip(args)
                    .all(|(param, arg)| param.accepts(arg))
            })
            .collect();
        if compatible.is_empty() {
            return Err(no_such());
        }

        let most_specific: Vec<&Operation> = compatible
            .iter()
            .copied()
            .filter(|candidate| {
                compatible.iter().all(|other| {
                    candidate
                        .params
                        .iter()
                        .zip(&other.params)
                        .all(|(mine, theirs)| mine.assignable_to(theirs))
                })
            })
            .collect();

        match most_specific.as_slice() {
            [only] => Ok(only.handler.clone()),
            _ => Err(CallbackError::Ambiguous {
                type_name: type_name.to_string(),
                operation: operation.to_string(),
                candidates: compatible.len(),
            }),
        }
    }

    fn resolve_arg(&self, term: &Term) -> CallbackResult<Arg> {
        match term {
            Term::Object(id) => {
                let (type_name, object) = self
                    .lookup(*id)
                    .ok_or(CallbackError::UnknownObject(*id))?;
                Ok(Arg::Object {
                    id: *id,
                    type_name,
                    object,
                })
            }
            other => Ok(Arg::Term(other.clone())),
        }
    }

    fn receiver_for(&self, target: &Target) -> CallbackResult<(String, Receiver)> {
        match target {
            Target::Object(id) | Target::Value(Term::Object(id)) => {
                let (type_name, object) = self
                    .lookup(*id)
                    .ok_or(CallbackError::UnknownObject(*id))?;
                Ok((type_name, Receiver::Object { id: *id, object }))
            }
            Target::Type(type_name) => Ok((type_name.clone(), Receiver::None)),
            Target::Value(term) => Ok((
                term.kind().type_name().to_string(),
                Receiver::Value(term.clone()),
            )),
        }
    }

    fn execute(
        &self,
        engine: Option<&Engine>,
        request: &CallbackRequestPayload,
    ) -> CallbackResult<(Returned, Vec<Arg>)> {
        let (type_name, receiver) = self.receiver_for(&request.target)?;
        let args = request
            .args
            .iter()
            .map(|term| self.resolve_arg(term))
            .collect::<CallbackResult<Vec<Arg>>>()?;
        let handler = self.resolve(&type_name, &request.operation, &args)?;

        let mut invocation = Invocation {
            engine,
            registry: self,
            receiver,
            args,
        };
        let returned = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut invocation)))
            .map_err(|payload| CallbackError::Panicked(panic_message(payload.as_ref())))??;
        Ok((returned, invocation.args))
    }

    /// Run a callback request and package its outcome.
    ///
    /// Failures of any kind (unknown target, no overload, handler error or
    /// panic) are captured into the outcome's error term.
    pub fn invoke(
        &self,
        engine: Option<&Engine>,
        request: &CallbackRequestPayload,
    ) -> CallbackOutcomePayload {
        tracing::debug!(
            callback = request.id,
            operation = %request.operation,
            arity = request.args.len(),
            "executing callback"
        );

        match self.execute(engine, request) {
            Ok((returned, args)) => {
                let value = match returned {
                    Returned::Nothing => None,
                    Returned::Value(term) => Some(term),
                    Returned::Object { type_name, object } => {
                        Some(Term::Object(self.register_shared(type_name, object)))
                    }
                };
                CallbackOutcomePayload {
                    id: request.id,
                    value,
                    error: None,
                    echoed_args: request
                        .want_echo
                        .then(|| args.iter().map(Arg::to_term).collect()),
                }
            }
            Err(err) => {
                tracing::warn!(
                    callback = request.id,
                    operation = %request.operation,
                    error = %err,
                    "callback failed"
                );
                CallbackOutcomePayload {
                    id: request.id,
                    value: None,
                    error: Some(err.to_term()),
                    echoed_args: request.want_echo.then(|| request.args.clone()),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
