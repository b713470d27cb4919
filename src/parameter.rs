//! Typed job parameters and their wire identifiers.
//!
//! Every value that crosses the queue implements [`JobParameter`], which gives
//! it a stable type identifier (used to resolve methods on the worker side)
//! and a string encoding produced by the pluggable [`Serializer`].

use crate::errors::JobError;
use crate::serializer::Serializer;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of the catch-all parameter type. Any argument is assignable to it.
pub const OBJECT_TYPE: &str = "object";

/// How an argument is handed to the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passing {
    /// By value. The only mode a replayable job supports.
    Value,
    /// By reference.
    ByRef,
    /// As an output slot.
    Out,
}

/// Declared type of a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterType {
    /// A concrete type identifier.
    Concrete(String),
    /// A generic type parameter, closed with the caller's argument type.
    Generic(&'static str),
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Concrete(name) => f.write_str(name),
            Self::Generic(name) => f.write_str(name),
        }
    }
}

/// Declared parameter of a job method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Declared type.
    pub ty: ParameterType,
    /// Passing mode.
    pub passing: Passing,
}

/// A serialized argument together with what is needed to decode it.
#[derive(Clone, Copy)]
pub struct RawArgument<'a> {
    /// Serialized value, `None` for null.
    pub raw: Option<&'a str>,
    /// Type identifier recorded in the descriptor.
    pub type_name: &'a str,
    /// Serializer the value was written with.
    pub serializer: &'a dyn Serializer,
}

/// A value that can be passed to a job method.
pub trait JobParameter: Sized + Send + 'static {
    /// Stable type identifier.
    fn type_name() -> String;

    /// Declared parameter for this type.
    fn parameter() -> Parameter {
        Parameter {
            ty: ParameterType::Concrete(Self::type_name()),
            passing: Passing::Value,
        }
    }

    /// Convert into a JSON value.
    fn to_value(&self) -> anyhow::Result<Value>;

    /// Convert from a JSON value.
    fn from_value(value: Value) -> anyhow::Result<Self>;

    /// Best-effort conversion of a raw string the serializer could not read.
    fn parse_fallback(_raw: &str) -> Option<Self> {
        None
    }

    /// Serialize for the wire. `None` encodes a null argument.
    fn encode(&self, serializer: &dyn Serializer) -> anyhow::Result<Option<String>> {
        match self.to_value()? {
            Value::Null => Ok(None),
            value => serializer.serialize(&value).map(Some),
        }
    }

    /// Deserialize from the wire, falling back to [`JobParameter::parse_fallback`].
    fn decode(argument: RawArgument<'_>) -> anyhow::Result<Self> {
        let Some(raw) = argument.raw else {
            return Self::from_value(Value::Null);
        };

        match argument
            .serializer
            .deserialize(raw)
            .and_then(Self::from_value)
        {
            Ok(value) => Ok(value),
            Err(error) => Self::parse_fallback(raw).ok_or(error),
        }
    }
}

macro_rules! impl_scalar_parameter {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl JobParameter for $ty {
                fn type_name() -> String {
                    $name.to_string()
                }

                fn to_value(&self) -> anyhow::Result<Value> {
                    Ok(serde_json::to_value(self)?)
                }

                fn from_value(value: Value) -> anyhow::Result<Self> {
                    Ok(serde_json::from_value(value)?)
                }

                fn parse_fallback(raw: &str) -> Option<Self> {
                    raw.trim().parse().ok()
                }
            }
        )*
    };
}

impl_scalar_parameter! {
    bool => "bool",
    i8 => "int8",
    i16 => "int16",
    i32 => "int32",
    i64 => "int64",
    u8 => "uint8",
    u16 => "uint16",
    u32 => "uint32",
    u64 => "uint64",
    usize => "uint64",
    f32 => "float32",
    f64 => "float64",
    char => "char",
    Uuid => "uuid",
}

impl JobParameter for String {
    fn type_name() -> String {
        "string".to_string()
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        Ok(Value::String(self.clone()))
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    fn parse_fallback(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }
}

impl JobParameter for Value {
    fn type_name() -> String {
        OBJECT_TYPE.to_string()
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        Ok(self.clone())
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        Ok(value)
    }

    fn parse_fallback(raw: &str) -> Option<Self> {
        Some(Value::String(raw.to_string()))
    }
}

/// Dates travel as RFC 3339 text rather than through the serializer, so
/// they round-trip regardless of the serializer's own date handling.
impl JobParameter for DateTime<Utc> {
    fn type_name() -> String {
        "datetime".to_string()
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        Ok(Value::String(self.to_rfc3339_opts(SecondsFormat::Nanos, true)))
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    fn parse_fallback(raw: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|date| date.with_timezone(&Utc))
    }

    fn encode(&self, _serializer: &dyn Serializer) -> anyhow::Result<Option<String>> {
        Ok(Some(self.to_rfc3339_opts(SecondsFormat::Nanos, true)))
    }
}

impl JobParameter for NaiveDate {
    fn type_name() -> String {
        "date".to_string()
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    fn parse_fallback(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

impl<T: JobParameter> JobParameter for Option<T> {
    fn type_name() -> String {
        format!("option<{}>", T::type_name())
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        match self {
            Some(value) => value.to_value(),
            None => Ok(Value::Null),
        }
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        match value {
            Value::Null => Ok(None),
            value => T::from_value(value).map(Some),
        }
    }

    fn parse_fallback(raw: &str) -> Option<Self> {
        T::parse_fallback(raw).map(Some)
    }

    fn encode(&self, serializer: &dyn Serializer) -> anyhow::Result<Option<String>> {
        match self {
            Some(value) => value.encode(serializer),
            None => Ok(None),
        }
    }

    fn decode(argument: RawArgument<'_>) -> anyhow::Result<Self> {
        match argument.raw {
            None => Ok(None),
            Some(_) => T::decode(argument).map(Some),
        }
    }
}

fn sequence_to_value<'a, T: JobParameter + 'a>(
    items: impl IntoIterator<Item = &'a T>,
) -> anyhow::Result<Value> {
    items
        .into_iter()
        .map(JobParameter::to_value)
        .collect::<anyhow::Result<Vec<_>>>()
        .map(Value::Array)
}

fn sequence_from_value<T: JobParameter, C: FromIterator<T>>(value: Value) -> anyhow::Result<C> {
    match value {
        Value::Array(items) => items.into_iter().map(T::from_value).collect(),
        other => anyhow::bail!("expected a sequence, found {other}"),
    }
}

// Every ordered or unordered collection shares the plain `list<T>`
// identifier, so the wire type does not depend on the container the caller
// happened to hold.
macro_rules! impl_sequence_parameter {
    ($($collection:ident $(: $bound:path)?),* $(,)?) => {
        $(
            impl<T: JobParameter $(+ $bound)?> JobParameter for $collection<T> {
                fn type_name() -> String {
                    format!("list<{}>", T::type_name())
                }

                fn to_value(&self) -> anyhow::Result<Value> {
                    sequence_to_value(self.iter())
                }

                fn from_value(value: Value) -> anyhow::Result<Self> {
                    sequence_from_value(value)
                }
            }
        )*
    };
}

impl_sequence_parameter! {
    Vec,
    VecDeque,
    BTreeSet: Ord,
}

impl<T: JobParameter + Eq + std::hash::Hash> JobParameter for HashSet<T> {
    fn type_name() -> String {
        format!("list<{}>", T::type_name())
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        sequence_to_value(self.iter())
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        sequence_from_value(value)
    }
}

fn map_to_value<'a, T: JobParameter + 'a>(
    entries: impl IntoIterator<Item = (&'a String, &'a T)>,
) -> anyhow::Result<Value> {
    let mut map = serde_json::Map::new();
    for (key, value) in entries {
        map.insert(key.clone(), value.to_value()?);
    }
    Ok(Value::Object(map))
}

fn map_from_value<T: JobParameter, C: FromIterator<(String, T)>>(
    value: Value,
) -> anyhow::Result<C> {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| T::from_value(value).map(|value| (key, value)))
            .collect(),
        other => anyhow::bail!("expected a map, found {other}"),
    }
}

impl<T: JobParameter> JobParameter for HashMap<String, T> {
    fn type_name() -> String {
        format!("map<string, {}>", T::type_name())
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        map_to_value(self.iter())
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        map_from_value(value)
    }
}

impl<T: JobParameter> JobParameter for BTreeMap<String, T> {
    fn type_name() -> String {
        format!("map<string, {}>", T::type_name())
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        map_to_value(self.iter())
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        map_from_value(value)
    }
}

/// A parameter passed by reference. Such methods cannot be published.
#[derive(Debug, Clone, PartialEq)]
pub struct ByRef<T>(pub T);

/// An output parameter. Such methods cannot be published.
#[derive(Debug, Clone, PartialEq)]
pub struct Out<T>(pub T);

macro_rules! impl_passing_parameter {
    ($($wrapper:ident => $passing:expr),*) => {
        $(
            impl<T: JobParameter> JobParameter for $wrapper<T> {
                fn type_name() -> String {
                    T::type_name()
                }

                fn parameter() -> Parameter {
                    Parameter {
                        ty: ParameterType::Concrete(T::type_name()),
                        passing: $passing,
                    }
                }

                fn to_value(&self) -> anyhow::Result<Value> {
                    self.0.to_value()
                }

                fn from_value(value: Value) -> anyhow::Result<Self> {
                    T::from_value(value).map($wrapper)
                }
            }
        )*
    };
}

impl_passing_parameter!(ByRef => Passing::ByRef, Out => Passing::Out);

/// Names a generic type parameter of a job method.
pub trait TypeVariable: Send + Sync + 'static {
    /// Name of the type parameter, for example `T`.
    const NAME: &'static str;
}

/// Declares a [`TypeVariable`] marker type.
#[macro_export]
macro_rules! type_variable {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {}

        impl $crate::TypeVariable for $name {
            const NAME: &'static str = stringify!($name);
        }
    };
}

type_variable!(
    /// The conventional first generic parameter.
    pub T
);
type_variable!(
    /// The conventional second generic parameter.
    pub U
);

/// A value of a generic parameter `V`, together with the concrete type it was
/// published with.
#[derive(Debug, Clone, PartialEq)]
pub struct Generic<V: TypeVariable = T> {
    value: Value,
    type_name: String,
    _variable: PhantomData<fn() -> V>,
}

impl<V: TypeVariable> Generic<V> {
    /// Concrete type identifier the generic parameter was closed with.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Raw JSON value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Convert into a concrete parameter type.
    pub fn into_inner<P: JobParameter>(self) -> anyhow::Result<P> {
        P::from_value(self.value)
    }
}

impl<V: TypeVariable> JobParameter for Generic<V> {
    fn type_name() -> String {
        V::NAME.to_string()
    }

    fn parameter() -> Parameter {
        Parameter {
            ty: ParameterType::Generic(V::NAME),
            passing: Passing::Value,
        }
    }

    fn to_value(&self) -> anyhow::Result<Value> {
        Ok(self.value.clone())
    }

    fn from_value(value: Value) -> anyhow::Result<Self> {
        Ok(Self {
            value,
            type_name: OBJECT_TYPE.to_string(),
            _variable: PhantomData,
        })
    }

    fn decode(argument: RawArgument<'_>) -> anyhow::Result<Self> {
        let value = match argument.raw {
            None => Value::Null,
            Some(raw) => argument
                .serializer
                .deserialize(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
        };

        Ok(Self {
            value,
            type_name: argument.type_name.to_string(),
            _variable: PhantomData,
        })
    }
}

/// Shape of a method's return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnShape {
    /// Nothing is returned.
    Unit,
    /// A value of the given type is returned.
    Value(String),
    /// A handle to a computation still running when the method returns.
    Deferred(String),
}

/// A value a function job may return.
pub trait JobReturn: Send + 'static {
    /// Shape reported in the method signature.
    fn shape() -> ReturnShape;

    /// Convert the returned value for logging.
    fn into_output(self) -> anyhow::Result<Option<Value>>;
}

impl JobReturn for () {
    fn shape() -> ReturnShape {
        ReturnShape::Unit
    }

    fn into_output(self) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

impl<P: JobParameter> JobReturn for P {
    fn shape() -> ReturnShape {
        ReturnShape::Value(P::type_name())
    }

    fn into_output(self) -> anyhow::Result<Option<Value>> {
        self.to_value().map(Some)
    }
}

/// A method result that is itself an asynchronous computation.
///
/// Methods returning it can be registered for completeness but are rejected
/// when published, because the computation cannot outlive the worker call.
pub struct Deferred<R: JobParameter>(pub BoxFuture<'static, R>);

impl<R: JobParameter> JobReturn for Deferred<R> {
    fn shape() -> ReturnShape {
        ReturnShape::Deferred(R::type_name())
    }

    fn into_output(self) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("deferred results cannot be replayed")
    }
}

/// Positional arguments of a decoded job.
#[derive(Clone)]
pub struct Arguments {
    values: Vec<Option<String>>,
    parameter_types: Vec<String>,
    serializer: Arc<dyn Serializer>,
}

impl std::fmt::Debug for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arguments")
            .field("values", &self.values)
            .field("parameter_types", &self.parameter_types)
            .finish_non_exhaustive()
    }
}

impl Arguments {
    pub(crate) fn new(
        values: Vec<Option<String>>,
        parameter_types: Vec<String>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            values,
            parameter_types,
            serializer,
        }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decode the argument at `position`.
    pub fn decode<P: JobParameter>(&self, position: usize) -> Result<P, JobError> {
        let parameter_type = self
            .parameter_types
            .get(position)
            .map_or_else(P::type_name, Clone::clone);

        let Some(raw) = self.values.get(position) else {
            return Err(JobError::Arguments {
                position,
                parameter_type,
                reason: "argument is missing".into(),
            });
        };

        P::decode(RawArgument {
            raw: raw.as_deref(),
            type_name: &parameter_type,
            serializer: self.serializer.as_ref(),
        })
        .map_err(|error| JobError::Arguments {
            position,
            parameter_type: parameter_type.clone(),
            reason: format!("{error:#}"),
        })
    }
}

/// A tuple of parameters a handler receives.
pub trait FromArguments: Sized + Send + 'static {
    /// Declared parameters in order.
    fn parameters() -> Vec<Parameter>;

    /// Decode all arguments.
    fn from_arguments(arguments: &Arguments) -> Result<Self, JobError>;
}

impl FromArguments for () {
    fn parameters() -> Vec<Parameter> {
        Vec::new()
    }

    fn from_arguments(_arguments: &Arguments) -> Result<Self, JobError> {
        Ok(())
    }
}

macro_rules! impl_from_arguments {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: JobParameter),+> FromArguments for ($($name,)+) {
            fn parameters() -> Vec<Parameter> {
                vec![$($name::parameter()),+]
            }

            fn from_arguments(arguments: &Arguments) -> Result<Self, JobError> {
                Ok(($(arguments.decode::<$name>($index)?,)+))
            }
        }
    };
}

impl_from_arguments!(A: 0);
impl_from_arguments!(A: 0, B: 1);
impl_from_arguments!(A: 0, B: 1, C: 2);
impl_from_arguments!(A: 0, B: 1, C: 2, D: 3);
impl_from_arguments!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_from_arguments!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_from_arguments!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_from_arguments!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use chrono::TimeZone;

    fn arguments(values: &[Option<&str>], types: &[&str]) -> Arguments {
        Arguments::new(
            values.iter().map(|v| v.map(str::to_string)).collect(),
            types.iter().map(|t| (*t).to_string()).collect(),
            Arc::new(JsonSerializer),
        )
    }

    #[test]
    fn dates_are_written_as_round_trippable_text() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let encoded = date.encode(&JsonSerializer).unwrap().unwrap();
        assert_eq!(encoded, "2024-03-01T12:30:00.000000000Z");

        let args = arguments(&[Some(&encoded)], &["datetime"]);
        assert_eq!(args.decode::<DateTime<Utc>>(0).unwrap(), date);
    }

    #[test]
    fn object_parameters_accept_raw_strings() {
        let args = arguments(&[Some("not json")], &["object"]);
        assert_eq!(
            args.decode::<Value>(0).unwrap(),
            Value::String("not json".into())
        );
    }

    #[test]
    fn numbers_fall_back_to_string_conversion() {
        let args = arguments(&[Some("\"42\""), Some(" 7 ")], &["int32", "int64"]);
        assert_eq!(args.decode::<i32>(0).unwrap(), 42);
        assert_eq!(args.decode::<i64>(1).unwrap(), 7);
    }

    #[test]
    fn nulls_only_decode_into_options() {
        let args = arguments(&[None], &["option<string>"]);
        assert_eq!(args.decode::<Option<String>>(0).unwrap(), None);
        assert!(matches!(
            args.decode::<i32>(0),
            Err(JobError::Arguments { position: 0, .. })
        ));
    }

    #[test]
    fn collections_share_the_list_identifier() {
        assert_eq!(Vec::<i32>::type_name(), "list<int32>");
        assert_eq!(VecDeque::<i32>::type_name(), "list<int32>");
        assert_eq!(BTreeSet::<i32>::type_name(), "list<int32>");
        assert_eq!(HashSet::<i32>::type_name(), "list<int32>");
    }

    #[test]
    fn generic_arguments_remember_their_type() {
        let args = arguments(&[Some("\"hello\"")], &["string"]);
        let generic = args.decode::<Generic<T>>(0).unwrap();
        assert_eq!(generic.type_name(), "string");
        assert_eq!(generic.into_inner::<String>().unwrap(), "hello");
    }

    #[test]
    fn missing_arguments_are_reported() {
        let args = arguments(&[], &[]);
        assert!(matches!(
            <(String,)>::from_arguments(&args),
            Err(JobError::Arguments { position: 0, .. })
        ));
    }
}
