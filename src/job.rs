//! The replayable description of a method call.

use crate::parameter::JobParameter;
use crate::serializer::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a job returns a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// The method returns nothing.
    Action,
    /// The method returns a value, which the worker logs and discards.
    Function,
}

/// The call a message replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Identifier of the type the method is called on.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Method name.
    pub method: String,
    /// Parameter type identifiers, generic parameters closed.
    pub parameter_types: Vec<String>,
    /// Serialized arguments in declaration order, `None` for null.
    pub arguments: Vec<Option<String>>,
}

/// Wire envelope stored in the `content` column of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobDescriptor {
    /// A call whose method returns nothing.
    Action(Invocation),
    /// A call whose method returns a value.
    Function(Invocation),
}

impl JobDescriptor {
    pub(crate) fn new(kind: JobKind, invocation: Invocation) -> Self {
        match kind {
            JobKind::Action => Self::Action(invocation),
            JobKind::Function => Self::Function(invocation),
        }
    }

    /// Kind of the call.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Action(_) => JobKind::Action,
            Self::Function(_) => JobKind::Function,
        }
    }

    /// The described call.
    pub fn invocation(&self) -> &Invocation {
        match self {
            Self::Action(invocation) | Self::Function(invocation) => invocation,
        }
    }

    /// Parse a stored descriptor.
    pub fn from_content(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Serialize for storage.
    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

type ArgumentEncoder =
    Box<dyn FnOnce(&dyn Serializer) -> anyhow::Result<Option<String>> + Send + 'static>;

/// One argument of a [`JobCall`].
pub struct Arg {
    type_name: Option<String>,
    encoder: ArgumentEncoder,
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arg")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl Arg {
    /// A value known at the call site.
    pub fn constant<P: JobParameter>(value: P) -> Self {
        Self {
            type_name: Some(P::type_name()),
            encoder: Box::new(move |serializer| value.encode(serializer)),
        }
    }

    /// A value computed by `f` exactly once, when the call is encoded.
    ///
    /// The closure runs in the publishing process, never on the worker.
    pub fn eval<P, F>(f: F) -> Self
    where
        P: JobParameter,
        F: FnOnce() -> P + Send + 'static,
    {
        Self {
            type_name: Some(P::type_name()),
            encoder: Box::new(move |serializer| f().encode(serializer)),
        }
    }

    /// A null argument of type `P`.
    pub fn null<P: JobParameter>() -> Self {
        Self {
            type_name: Some(P::type_name()),
            encoder: Box::new(|_| Ok(None)),
        }
    }

    /// Any sequence, normalized to a plain list.
    pub fn sequence<P, I>(items: I) -> Self
    where
        P: JobParameter,
        I: IntoIterator<Item = P>,
    {
        Self::constant(items.into_iter().collect::<Vec<P>>())
    }

    /// A raw JSON value without a concrete type.
    ///
    /// It is accepted by concrete parameters but cannot close a generic one.
    pub fn untyped(value: Value) -> Self {
        Self {
            type_name: None,
            encoder: Box::new(move |serializer| match value {
                Value::Null => Ok(None),
                value => serializer.serialize(&value).map(Some),
            }),
        }
    }

    pub(crate) fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub(crate) fn encode(self, serializer: &dyn Serializer) -> anyhow::Result<Option<String>> {
        (self.encoder)(serializer)
    }
}

impl<P: JobParameter> From<P> for Arg {
    fn from(value: P) -> Self {
        Self::constant(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::constant(value.to_string())
    }
}

/// A method call on a registered job type, ready to be published.
///
/// ```
/// use fatqueue::{Arg, JobCall};
///
/// let call = JobCall::new("mailer", "send")
///     .arg("alice@example.com".to_string())
///     .arg(Arg::eval(chrono::Utc::now));
/// assert_eq!(call.method(), "send");
/// ```
#[derive(Debug)]
pub struct JobCall {
    type_name: String,
    method: String,
    arguments: Vec<Arg>,
}

impl JobCall {
    /// Call `method` on the job type `type_name`.
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
            arguments: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, argument: impl Into<Arg>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Identifier of the target type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn into_parts(self) -> (String, String, Vec<Arg>) {
        (self.type_name, self.method, self.arguments)
    }

    pub(crate) fn argument_types(&self) -> Vec<Option<&str>> {
        self.arguments.iter().map(Arg::type_name).collect()
    }
}
