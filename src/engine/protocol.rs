//! Structured-channel payloads
//!
//! Four payload kinds travel over the structured channel once the bootstrap
//! handshake has taught the worker their shape: goals and callback outcomes
//! flow host → worker, results and callback requests flow worker → host.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::term::{ObjectId, Term};

/// Operation name of the reserved callback that announces the goal loop
pub const BOOTSTRAP_OPERATION: &str = "$goal_loop_ready";

/// Monotonic goal identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GoalId(pub u64);

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Description of the variables a goal binds on success
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Result variable names, in binding order
    pub variables: Vec<String>,
}

impl OutputSpec {
    /// No result variables.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Result variables in the given order.
    pub fn vars<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            variables: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of bindings a successful result must carry.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// Whether no bindings are expected.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Goal submitted to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalPayload {
    /// Goal identifier
    pub id: GoalId,
    /// Worker-native code to evaluate
    pub code: String,
    /// Input bindings, in order
    pub inputs: Vec<Term>,
    /// Expected result variables
    pub output: OutputSpec,
}

/// Result of a goal reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Identifier of the goal this answers
    pub id: GoalId,
    /// Whether the goal succeeded
    pub succeeded: bool,
    /// Bindings, sized by the goal's output spec
    pub bindings: Vec<Term>,
    /// Worker-specific "don't know" truth value
    pub undefined: bool,
    /// Error payload, when the goal raised
    pub error: Option<Term>,
}

/// Receiver of a callback request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
    /// A registered host object
    Object(ObjectId),
    /// A type, for static operations
    Type(String),
    /// A plain value passed through as receiver
    Value(Term),
}

/// Re-entrant call from the worker into the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRequestPayload {
    /// Worker-assigned callback identifier
    pub id: u64,
    /// Receiver of the operation
    pub target: Target,
    /// Operation name
    pub operation: String,
    /// Arguments, in order
    pub args: Vec<Term>,
    /// Whether the outcome should echo the (possibly updated) arguments
    pub want_echo: bool,
}

impl CallbackRequestPayload {
    /// Whether this is the reserved goal-loop announcement.
    pub fn is_bootstrap_marker(&self) -> bool {
        self.operation == BOOTSTRAP_OPERATION
    }
}

/// Host answer to a callback request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackOutcomePayload {
    /// Identifier of the request this answers
    pub id: u64,
    /// Returned value (object results are sent as references)
    pub value: Option<Term>,
    /// Error payload, when the operation failed
    pub error: Option<Term>,
    /// Echoed arguments, when requested
    pub echoed_args: Option<Vec<Term>>,
}

/// Shape example sent during the bootstrap handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeExample {
    /// Name of the kind being described
    pub kind: String,
    /// Example instance
    pub example: Box<Payload>,
}

/// Everything that travels over the structured channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Bootstrap shape example
    TypeExample(TypeExample),
    /// Host → worker goal
    Goal(GoalPayload),
    /// Worker → host goal result
    Result(ResultPayload),
    /// Worker → host callback request
    CallbackRequest(CallbackRequestPayload),
    /// Host → worker callback answer
    CallbackOutcome(CallbackOutcomePayload),
}

impl Payload {
    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::TypeExample(_) => "type_example",
            Payload::Goal(_) => "goal",
            Payload::Result(_) => "result",
            Payload::CallbackRequest(_) => "callback_request",
            Payload::CallbackOutcome(_) => "callback_outcome",
        }
    }
}

/// Fixed sequence of shape examples sent before any goal.
///
/// One example per payload kind, followed by one per transferable term kind
/// (wrapped in a goal's input list).
pub fn type_examples() -> Vec<Payload> {
    let sample_terms = vec![
        Term::Nil,
        Term::Bool(true),
        Term::Int(0),
        Term::Float(0.0),
        Term::atom("a"),
        Term::string(""),
        Term::List(vec![Term::Int(0)]),
        Term::compound("f", vec![Term::Var("X".to_string())]),
        Term::Object(ObjectId(0)),
    ];

    let payloads = vec![
        Payload::Goal(GoalPayload {
            id: GoalId(0),
            code: String::new(),
            inputs: Vec::new(),
            output: OutputSpec::vars(["X"]),
        }),
        Payload::Result(ResultPayload {
            id: GoalId(0),
            succeeded: true,
            bindings: vec![Term::Nil],
            undefined: false,
            error: None,
        }),
        Payload::CallbackRequest(CallbackRequestPayload {
            id: 0,
            target: Target::Type(String::new()),
            operation: String::new(),
            args: Vec::new(),
            want_echo: false,
        }),
        Payload::CallbackOutcome(CallbackOutcomePayload {
            id: 0,
            value: Some(Term::Nil),
            error: None,
            echoed_args: None,
        }),
    ];

    let mut examples: Vec<Payload> = payloads
        .into_iter()
        .map(|payload| {
            Payload::TypeExample(TypeExample {
                kind: payload.kind().to_string(),
                example: Box::new(payload),
            })
        })
        .collect();

    for term in sample_terms {
        examples.push(Payload::TypeExample(TypeExample {
            kind: term.kind().type_name().to_string(),
            example: Box::new(Payload::Goal(GoalPayload {
                id: GoalId(0),
                code: String::new(),
                inputs: vec![term],
                output: OutputSpec::empty(),
            })),
        }));
    }

    examples
}
