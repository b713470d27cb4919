//! Registry of job types and the methods a message may call on them.
//!
//! Messages only carry strings: a type identifier, a method name and the
//! parameter type identifiers. The registry maps those back to a handler,
//! matching parameters the way a compiler would pick an overload.

use crate::errors::JobError;
use crate::executor::JobContext;
use crate::job::{Invocation, JobCall, JobDescriptor, JobKind};
use crate::parameter::{
    Arguments, FromArguments, JobReturn, OBJECT_TYPE, Parameter, ParameterType, Passing,
    ReturnShape,
};
use crate::serializer::Serializer;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A type-erased job target.
pub type Instance = Arc<dyn Any + Send + Sync>;

type HandlerFuture = BoxFuture<'static, anyhow::Result<Option<Value>>>;
type Handler<Context> = Arc<
    dyn Fn(Option<Instance>, Arguments, JobContext<Context>) -> Result<HandlerFuture, JobError>
        + Send
        + Sync,
>;
type Upcast = Arc<dyn Fn(Instance) -> Option<Instance> + Send + Sync>;
type Factory<Context> = Arc<dyn Fn(&Context) -> Option<Instance> + Send + Sync>;
type Disposer = Arc<dyn Fn(&Instance) -> anyhow::Result<()> + Send + Sync>;

/// Whether a method may be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Callable through the queue.
    Public,
    /// Registered but never accepted by the encoder.
    Internal,
}

/// Signature of a registered method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Method name.
    pub name: String,
    /// Declared parameters.
    pub parameters: Vec<Parameter>,
    /// Return shape.
    pub returns: ReturnShape,
    /// Whether the method runs without a target instance.
    pub is_static: bool,
    /// Whether the method may be published.
    pub visibility: Visibility,
}

impl MethodSignature {
    /// Kind of envelope a call to this method produces.
    pub fn kind(&self) -> JobKind {
        match self.returns {
            ReturnShape::Unit => JobKind::Action,
            _ => JobKind::Function,
        }
    }

    fn generic_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parameters.iter().filter_map(|parameter| match parameter.ty {
            ParameterType::Generic(name) => Some(name),
            ParameterType::Concrete(_) => None,
        })
    }
}

/// A method of the job type `T`.
pub struct Method<T, Context> {
    signature: MethodSignature,
    handler: Handler<Context>,
    _target: PhantomData<fn() -> T>,
}

fn downcast<T: Send + Sync + 'static>(instance: Option<Instance>) -> Result<Arc<T>, JobError> {
    let type_name = std::any::type_name::<T>();
    let instance = instance.ok_or_else(|| JobError::Activation {
        type_name: type_name.to_string(),
        source: anyhow::anyhow!("no target instance was created"),
    })?;

    instance.downcast::<T>().map_err(|_| JobError::Activation {
        type_name: type_name.to_string(),
        source: anyhow::anyhow!("the activated instance has an unexpected type"),
    })
}

impl<T, Context> Method<T, Context>
where
    T: Send + Sync + 'static,
    Context: Clone + Send + Sync + 'static,
{
    /// A method on an instance of `T` that returns nothing.
    pub fn action<A, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        A: FromArguments,
        F: Fn(Arc<T>, A, JobContext<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::instance(name, handler)
    }

    /// A method on an instance of `T` that returns a value.
    pub fn function<A, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        A: FromArguments,
        R: JobReturn,
        F: Fn(Arc<T>, A, JobContext<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::instance(name, handler)
    }

    /// A method that needs no instance and returns nothing.
    pub fn static_action<A, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        A: FromArguments,
        F: Fn(A, JobContext<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::without_instance(name, handler)
    }

    /// A method that needs no instance and returns a value.
    pub fn static_function<A, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        A: FromArguments,
        R: JobReturn,
        F: Fn(A, JobContext<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::without_instance(name, handler)
    }

    /// Keep the method out of reach of publishers.
    pub fn internal(mut self) -> Self {
        self.signature.visibility = Visibility::Internal;
        self
    }

    /// Signature of the method.
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    fn instance<A, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        A: FromArguments,
        R: JobReturn,
        F: Fn(Arc<T>, A, JobContext<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler: Handler<Context> = Arc::new(move |instance, arguments, ctx| {
            let target = downcast::<T>(instance)?;
            let arguments = A::from_arguments(&arguments)?;
            let future = handler(target, arguments, ctx);
            Ok(async move { future.await?.into_output() }.boxed())
        });

        Self::new(name, A::parameters(), R::shape(), false, handler)
    }

    fn without_instance<A, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        A: FromArguments,
        R: JobReturn,
        F: Fn(A, JobContext<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler: Handler<Context> = Arc::new(move |_instance, arguments, ctx| {
            let arguments = A::from_arguments(&arguments)?;
            let future = handler(arguments, ctx);
            Ok(async move { future.await?.into_output() }.boxed())
        });

        Self::new(name, A::parameters(), R::shape(), true, handler)
    }

    fn new(
        name: impl Into<String>,
        parameters: Vec<Parameter>,
        returns: ReturnShape,
        is_static: bool,
        handler: Handler<Context>,
    ) -> Self {
        Self {
            signature: MethodSignature {
                name: name.into(),
                parameters,
                returns,
                is_static,
                visibility: Visibility::Public,
            },
            handler,
            _target: PhantomData,
        }
    }
}

/// Declaration of a job type `T`: its identifier, methods, base types,
/// activation and disposal.
///
/// ```
/// use fatqueue::{JobRegistry, JobType, Method};
/// use std::sync::Arc;
///
/// struct Mailer;
///
/// let mut registry = JobRegistry::<()>::default();
/// registry.register(
///     JobType::<Mailer, ()>::new("mailer")
///         .factory(|_| Some(Mailer))
///         .method(Method::action("send", |_mailer: Arc<Mailer>, (to,): (String,), _ctx| async move {
///             println!("sending to {to}");
///             Ok(())
///         })),
/// );
/// assert!(registry.contains("mailer"));
/// ```
pub struct JobType<T, Context> {
    name: String,
    bases: Vec<(String, Upcast)>,
    methods: Vec<Method<T, Context>>,
    factory: Option<Factory<Context>>,
    disposer: Option<Disposer>,
}

impl<T, Context> JobType<T, Context>
where
    T: Send + Sync + 'static,
    Context: Clone + Send + Sync + 'static,
{
    /// Declare a job type with the identifier `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bases: Vec::new(),
            methods: Vec::new(),
            factory: None,
            disposer: None,
        }
    }

    /// Make the methods of the registered type `base` callable on `T`.
    ///
    /// `T` also becomes assignable to `base` during method resolution.
    pub fn inherits<B, F>(mut self, base: impl Into<String>, upcast: F) -> Self
    where
        B: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Arc<B> + Send + Sync + 'static,
    {
        let upcast: Upcast = Arc::new(move |instance: Instance| {
            let target = instance.downcast::<T>().ok()?;
            let base: Instance = upcast(target);
            Some(base)
        });
        self.bases.push((base.into(), upcast));
        self
    }

    /// Register a method.
    pub fn method(mut self, method: Method<T, Context>) -> Self {
        self.methods.push(method);
        self
    }

    /// Create instances from the application context.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Context) -> Option<T> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(move |context: &Context| {
            factory(context).map(|target| Arc::new(target) as Instance)
        }));
        self
    }

    /// Release resources held by an instance once its job has run.
    pub fn disposable<F>(mut self, dispose: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.disposer = Some(Arc::new(move |instance: &Instance| {
            match instance.downcast_ref::<T>() {
                Some(target) => dispose(target),
                None => Ok(()),
            }
        }));
        self
    }
}

struct MethodEntry<Context> {
    signature: MethodSignature,
    handler: Handler<Context>,
}

struct TypeEntry<Context> {
    bases: Vec<(String, Upcast)>,
    methods: Vec<Arc<MethodEntry<Context>>>,
    factory: Option<Factory<Context>>,
    disposer: Option<Disposer>,
}

/// A method found for a descriptor, closed over its generic arguments.
pub struct ResolvedMethod<Context> {
    type_name: String,
    entry: Arc<MethodEntry<Context>>,
    upcasts: Vec<Upcast>,
    type_arguments: Vec<(String, String)>,
}

impl<Context> ResolvedMethod<Context> {
    /// Identifier of the type the method was called on.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Signature of the method.
    pub fn signature(&self) -> &MethodSignature {
        &self.entry.signature
    }

    /// Generic parameters and the concrete types they were closed with.
    pub fn type_arguments(&self) -> &[(String, String)] {
        &self.type_arguments
    }

    /// View the activated instance as the type declaring the method.
    pub(crate) fn receiver(&self, instance: Instance) -> Option<Instance> {
        self.upcasts
            .iter()
            .try_fold(instance, |instance, upcast| upcast(instance))
    }

    pub(crate) fn call(
        &self,
        receiver: Option<Instance>,
        arguments: Arguments,
        ctx: JobContext<Context>,
    ) -> Result<HandlerFuture, JobError> {
        (self.entry.handler)(receiver, arguments, ctx)
    }
}

struct Candidate<Context> {
    entry: Arc<MethodEntry<Context>>,
    upcasts: Vec<Upcast>,
}

#[derive(Debug, Default)]
struct Binding {
    type_arguments: Vec<(String, String)>,
}

/// Registry of job types, keyed by type identifier.
pub struct JobRegistry<Context> {
    types: HashMap<String, TypeEntry<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            types: HashMap::new(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    /// Register a job type, replacing any type with the same identifier.
    pub fn register<T: Send + Sync + 'static>(&mut self, job_type: JobType<T, Context>) {
        let methods = job_type
            .methods
            .into_iter()
            .map(|method| {
                Arc::new(MethodEntry {
                    signature: method.signature,
                    handler: method.handler,
                })
            })
            .collect();

        self.types.insert(
            job_type.name,
            TypeEntry {
                bases: job_type.bases,
                methods,
                factory: job_type.factory,
                disposer: job_type.disposer,
            },
        );
    }

    /// Builder-style [`JobRegistry::register`].
    pub fn with<T: Send + Sync + 'static>(mut self, job_type: JobType<T, Context>) -> Self {
        self.register(job_type);
        self
    }

    /// Whether a type with this identifier is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Signatures of the methods declared directly on a type.
    pub fn signatures(&self, type_name: &str) -> Vec<&MethodSignature> {
        self.types
            .get(type_name)
            .map(|entry| entry.methods.iter().map(|m| &m.signature).collect())
            .unwrap_or_default()
    }

    /// Whether a value of type `actual` can be passed where `declared` is expected.
    pub fn is_assignable(&self, declared: &str, actual: &str) -> bool {
        if declared == actual || declared == OBJECT_TYPE {
            return true;
        }

        let mut visited = HashSet::new();
        let mut pending = vec![actual];
        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(entry) = self.types.get(current) else {
                continue;
            };
            for (base, _) in &entry.bases {
                if base == declared {
                    return true;
                }
                pending.push(base);
            }
        }

        false
    }

    /// Methods named `method` on `type_name` and its bases, own methods first.
    fn candidates(&self, type_name: &str, method: &str) -> Vec<Candidate<Context>> {
        let mut candidates = Vec::new();
        let mut visited = HashSet::new();
        self.collect_candidates(type_name, method, Vec::new(), &mut visited, &mut candidates);
        candidates
    }

    fn collect_candidates<'a>(
        &'a self,
        type_name: &'a str,
        method: &str,
        upcasts: Vec<Upcast>,
        visited: &mut HashSet<&'a str>,
        candidates: &mut Vec<Candidate<Context>>,
    ) {
        if !visited.insert(type_name) {
            return;
        }
        let Some(entry) = self.types.get(type_name) else {
            return;
        };

        candidates.extend(
            entry
                .methods
                .iter()
                .filter(|entry| entry.signature.name == method)
                .map(|entry| Candidate {
                    entry: entry.clone(),
                    upcasts: upcasts.clone(),
                }),
        );

        for (base, upcast) in &entry.bases {
            let mut chain = upcasts.clone();
            chain.push(upcast.clone());
            self.collect_candidates(base, method, chain, visited, candidates);
        }
    }

    /// Match declared parameters against actual argument types.
    ///
    /// Arguments without a concrete type match any concrete parameter and
    /// leave generic parameters unbound.
    fn bind(&self, parameters: &[Parameter], actual: &[Option<&str>]) -> Option<Binding> {
        if parameters.len() != actual.len() {
            return None;
        }

        let mut binding = Binding::default();
        for (parameter, actual) in parameters.iter().zip(actual) {
            match (&parameter.ty, actual) {
                (_, None) => {}
                (ParameterType::Generic(name), Some(actual)) => {
                    let bound = binding
                        .type_arguments
                        .iter()
                        .find(|(bound_name, _)| bound_name == name);
                    match bound {
                        Some((_, bound)) if bound != actual => return None,
                        Some(_) => {}
                        None => binding
                            .type_arguments
                            .push(((*name).to_string(), (*actual).to_string())),
                    }
                }
                (ParameterType::Concrete(declared), Some(actual)) => {
                    if !self.is_assignable(declared, actual) {
                        return None;
                    }
                }
            }
        }

        Some(binding)
    }

    /// Turn a call into a descriptor, rejecting anything a separate process
    /// could not replay.
    ///
    /// Arguments are evaluated only once the call has been validated.
    pub fn encode(
        &self,
        call: JobCall,
        serializer: &dyn Serializer,
    ) -> Result<JobDescriptor, JobError> {
        let type_name = call.type_name();
        let method = call.method();
        if !self.contains(type_name) {
            return Err(JobError::encode(format!(
                "the type `{type_name}` is not registered"
            )));
        }

        let candidates = self.candidates(type_name, method);
        if candidates.is_empty() {
            return Err(JobError::encode(format!(
                "`{type_name}` has no method named `{method}`"
            )));
        }

        let actual = call.argument_types();
        let arity: Vec<_> = candidates
            .iter()
            .filter(|candidate| candidate.entry.signature.parameters.len() == actual.len())
            .collect();
        if arity.is_empty() {
            return Err(JobError::encode(format!(
                "no overload of `{type_name}::{method}` takes {} arguments",
                actual.len()
            )));
        }

        let (candidate, binding) = arity
            .into_iter()
            .find_map(|candidate| {
                self.bind(&candidate.entry.signature.parameters, &actual)
                    .map(|binding| (candidate, binding))
            })
            .ok_or_else(|| {
                let types: Vec<_> = actual.iter().map(|t| t.unwrap_or("?")).collect();
                JobError::encode(format!(
                    "no overload of `{type_name}::{method}` accepts ({})",
                    types.join(", ")
                ))
            })?;

        let signature = &candidate.entry.signature;
        validate(type_name, signature, &binding)?;

        let parameter_types = signature
            .parameters
            .iter()
            .map(|parameter| match &parameter.ty {
                ParameterType::Concrete(declared) => declared.clone(),
                ParameterType::Generic(name) => binding
                    .type_arguments
                    .iter()
                    .find(|(bound_name, _)| bound_name == name)
                    .map(|(_, bound)| bound.clone())
                    .unwrap_or_else(|| (*name).to_string()),
            })
            .collect();
        let kind = signature.kind();

        let (type_name, method, arguments) = call.into_parts();
        let arguments = arguments
            .into_iter()
            .enumerate()
            .map(|(position, argument)| {
                argument.encode(serializer).map_err(|error| {
                    JobError::encode(format!("argument {position} cannot be serialized: {error:#}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobDescriptor::new(
            kind,
            Invocation {
                type_name,
                method,
                parameter_types,
                arguments,
            },
        ))
    }

    /// Find the method a descriptor calls.
    pub fn resolve(&self, invocation: &Invocation) -> Result<ResolvedMethod<Context>, JobError> {
        let actual: Vec<_> = invocation
            .parameter_types
            .iter()
            .map(|t| Some(t.as_str()))
            .collect();

        self.candidates(&invocation.type_name, &invocation.method)
            .into_iter()
            .find_map(|candidate| {
                self.bind(&candidate.entry.signature.parameters, &actual)
                    .map(|binding| ResolvedMethod {
                        type_name: invocation.type_name.clone(),
                        entry: candidate.entry,
                        upcasts: candidate.upcasts,
                        type_arguments: binding.type_arguments,
                    })
            })
            .ok_or_else(|| JobError::MethodNotFound {
                type_name: invocation.type_name.clone(),
                method: invocation.method.clone(),
                parameter_types: invocation.parameter_types.clone(),
            })
    }

    /// Create an instance through the type's factory.
    pub(crate) fn activate(
        &self,
        type_name: &str,
        context: &Context,
    ) -> anyhow::Result<Option<Instance>> {
        let entry = self
            .types
            .get(type_name)
            .ok_or_else(|| anyhow::anyhow!("the type `{type_name}` is not registered"))?;
        let factory = entry
            .factory
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("the type `{type_name}` has no factory"))?;
        Ok(factory(context))
    }

    /// Dispose of an instance activated for `type_name`, if it is disposable.
    pub(crate) fn dispose(&self, type_name: &str, instance: &Instance) -> anyhow::Result<()> {
        match self.types.get(type_name).and_then(|e| e.disposer.as_ref()) {
            Some(dispose) => dispose(instance),
            None => Ok(()),
        }
    }
}

fn validate(type_name: &str, signature: &MethodSignature, binding: &Binding) -> Result<(), JobError> {
    let method = &signature.name;

    if signature.visibility != Visibility::Public {
        return Err(JobError::encode(format!(
            "only public methods can be published, `{type_name}::{method}` is internal"
        )));
    }

    if let ReturnShape::Deferred(_) = signature.returns {
        return Err(JobError::encode(format!(
            "`{type_name}::{method}` returns a deferred result, which cannot outlive the call"
        )));
    }

    if let Some(position) = signature
        .parameters
        .iter()
        .position(|parameter| parameter.passing != Passing::Value)
    {
        return Err(JobError::encode(format!(
            "parameter {position} of `{type_name}::{method}` is passed by reference or as output"
        )));
    }

    let mut unbound: Vec<_> = signature
        .generic_names()
        .filter(|name| !binding.type_arguments.iter().any(|(bound, _)| bound == name))
        .collect();
    unbound.sort_unstable();
    unbound.dedup();
    if !unbound.is_empty() {
        return Err(JobError::encode(format!(
            "`{type_name}::{method}` has unassigned generic type parameters: {}",
            unbound.join(", ")
        )));
    }

    Ok(())
}
