//! Task registration and invocation
//!
//! Two kinds of tasks can be registered:
//!
//! - structured tasks implementing [`CeleryTask`]: a fresh instance is built
//!   for every invocation, parses its named arguments, then runs
//! - plain callables such as `|a: i64, b: i64| a + b`: positional arguments
//!   are coerced into the declared parameter types
//!
//! Both are turned into a [`TaskHandler`] when registered, so the worker pool
//! only ever sees one invocation contract. Task bodies run on their own tokio
//! task; a panic is reported as [`TaskError::TaskFailure`] and never reaches
//! the worker loop.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::error::{TaskError, TaskResult};
use crate::protocol::{Kwargs, TaskMessage};

/// Invocation contract every registered task is normalized into
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn invoke(&self, message: &TaskMessage) -> TaskResult<Value>;
}

/// A task with explicit argument parsing
///
/// ```rust
/// use celery_queue::{CeleryTask, Kwargs, TaskError, TaskResult};
/// use serde_json::{json, Value};
///
/// #[derive(Default)]
/// struct Add {
///     a: i64,
///     b: i64,
/// }
///
/// #[async_trait::async_trait]
/// impl CeleryTask for Add {
///     fn parse_kwargs(&mut self, kwargs: &Kwargs) -> TaskResult<()> {
///         self.a = kwargs.get("a").and_then(Value::as_i64).ok_or_else(|| TaskError::argument("a"))?;
///         self.b = kwargs.get("b").and_then(Value::as_i64).ok_or_else(|| TaskError::argument("b"))?;
///         Ok(())
///     }
///
///     async fn run_task(&mut self) -> TaskResult<Value> {
///         Ok(json!(self.a + self.b))
///     }
///
///     fn arg_names(&self) -> &'static [&'static str] {
///         &["a", "b"]
///     }
/// }
/// ```
#[async_trait]
pub trait CeleryTask: Send + 'static {
    /// Read named arguments into this instance
    fn parse_kwargs(&mut self, kwargs: &Kwargs) -> TaskResult<()>;

    /// Execute with the parsed arguments
    async fn run_task(&mut self) -> TaskResult<Value>;

    /// Names given to positional arguments, in order.
    ///
    /// Empty means the task only accepts named arguments.
    fn arg_names(&self) -> &'static [&'static str] {
        &[]
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

fn join_failure(task_name: &str, error: JoinError) -> TaskError {
    if error.is_panic() {
        TaskError::task_failure(format!(
            "{} panicked: {}",
            task_name,
            panic_message(error.into_panic())
        ))
    } else {
        TaskError::task_failure(format!("{} was cancelled", task_name))
    }
}

/// Named arguments for a structured task, synthesizing them from positional
/// arguments when the message carries no named ones
fn named_arguments(
    task_name: &str,
    arg_names: &[&str],
    message: &TaskMessage,
) -> TaskResult<Kwargs> {
    if !message.kwargs.is_empty() || message.args.is_empty() {
        return Ok(message.kwargs.clone());
    }
    if arg_names.is_empty() {
        return Err(TaskError::argument(format!(
            "{} accepts named arguments only, got {} positional",
            task_name,
            message.args.len()
        )));
    }
    if message.args.len() > arg_names.len() {
        return Err(TaskError::argument(format!(
            "{} takes at most {} positional arguments, got {}",
            task_name,
            arg_names.len(),
            message.args.len()
        )));
    }

    Ok(arg_names
        .iter()
        .zip(message.args.iter())
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect())
}

/// Adapter turning a [`CeleryTask`] factory into a [`TaskHandler`]
///
/// The factory, the positional mapping and the task body all run on a
/// spawned tokio task, so a panic in any of them becomes a failure result.
pub struct StructuredHandler<T, F> {
    factory: Arc<F>,
    _task: PhantomData<fn() -> T>,
}

impl<T, F> StructuredHandler<T, F>
where
    T: CeleryTask,
    F: Fn() -> T + Send + Sync + 'static,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            _task: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> TaskHandler for StructuredHandler<T, F>
where
    T: CeleryTask,
    F: Fn() -> T + Send + Sync + 'static,
{
    async fn invoke(&self, message: &TaskMessage) -> TaskResult<Value> {
        let factory = self.factory.clone();
        let owned = message.clone();

        tokio::spawn(async move {
            let mut task = (*factory)();
            let kwargs = named_arguments(&owned.task, task.arg_names(), &owned)?;
            task.parse_kwargs(&kwargs)?;
            task.run_task().await
        })
        .await
        .map_err(|e| join_failure(&message.task, e))?
    }
}

fn normalize_number(value: Value) -> Value {
    if let Value::Number(number) = &value {
        if number.is_f64() {
            if let Some(float) = number.as_f64() {
                if float.fract() == 0.0 && float >= i64::MIN as f64 && float < i64::MAX as f64 {
                    return Value::from(float as i64);
                }
            }
        }
    }
    value
}

/// Convert one positional argument into the declared parameter type
///
/// Integral floats are narrowed to integers first so that `2.0` reaches an
/// `i32` parameter as `2`.
fn coerce<A: DeserializeOwned>(position: usize, value: Value) -> TaskResult<A> {
    serde_json::from_value(normalize_number(value)).map_err(|e| {
        TaskError::argument(format!(
            "argument {} is not a valid {}: {}",
            position,
            std::any::type_name::<A>(),
            e
        ))
    })
}

fn serialized<T: Serialize>(value: T) -> TaskResult<Value> {
    serde_json::to_value(value).map_err(|e| TaskError::invalid_payload(e.to_string()))
}

/// Values a plain callable may return
///
/// Implemented for JSON-like primitives, strings, collections and
/// [`Value`]. A `Result` stores its `Err` as a failure result. Any other
/// serializable type can be returned wrapped in [`Json`].
pub trait IntoTaskOutput {
    fn into_task_output(self) -> TaskResult<Value>;
}

/// Return value of a plain callable that serializes its content as is
///
/// ```rust
/// use celery_queue::registry::Json;
///
/// #[derive(serde::Serialize)]
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// let origin = || Json(Point { x: 0, y: 0 });
/// # let _ = origin;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoTaskOutput for Json<T> {
    fn into_task_output(self) -> TaskResult<Value> {
        serialized(self.0)
    }
}

macro_rules! impl_serialized_output {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoTaskOutput for $ty {
                fn into_task_output(self) -> TaskResult<Value> {
                    serialized(self)
                }
            }
        )*
    };
}

impl_serialized_output!(
    (), bool, char, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64,
    String, &'static str, Value, Kwargs,
);

macro_rules! impl_generic_output {
    ($(<$($param:ident),+> $ty:ty;)*) => {
        $(
            impl<$($param),+> IntoTaskOutput for $ty
            where
                $ty: Serialize,
            {
                fn into_task_output(self) -> TaskResult<Value> {
                    serialized(self)
                }
            }
        )*
    };
}

impl_generic_output! {
    <T> Vec<T>;
    <T> Option<T>;
    <K, V, S> HashMap<K, V, S>;
    <K, V> BTreeMap<K, V>;
    <A, B> (A, B);
    <A, B, C> (A, B, C);
    <A, B, C, D> (A, B, C, D);
}

impl<T, E> IntoTaskOutput for Result<T, E>
where
    T: IntoTaskOutput,
    E: fmt::Display,
{
    fn into_task_output(self) -> TaskResult<Value> {
        match self {
            Ok(value) => value.into_task_output(),
            Err(e) => Err(TaskError::task_failure(e.to_string())),
        }
    }
}

/// Plain callables with typed parameters
///
/// Implemented for `Fn` closures and functions taking up to six
/// deserializable parameters and returning an [`IntoTaskOutput`] value.
pub trait TaskFn<Args>: Send + Sync + 'static {
    /// Declared parameter types, in order
    fn param_types() -> Vec<&'static str>;

    /// Call with exactly as many arguments as [`TaskFn::param_types`]
    fn call(&self, args: Vec<Value>) -> TaskResult<Value>;
}

macro_rules! impl_task_fn {
    ($($arg:ident),*) => {
        impl<F, R, $($arg,)*> TaskFn<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: IntoTaskOutput,
            $($arg: DeserializeOwned,)*
        {
            fn param_types() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$arg>()),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(&self, args: Vec<Value>) -> TaskResult<Value> {
                let mut args = args.into_iter().enumerate();
                $(
                    let $arg: $arg = match args.next() {
                        Some((position, value)) => coerce(position, value)?,
                        None => return Err(TaskError::argument("missing positional argument")),
                    };
                )*
                (self)($($arg),*).into_task_output()
            }
        }
    };
}

impl_task_fn!();
impl_task_fn!(A1);
impl_task_fn!(A1, A2);
impl_task_fn!(A1, A2, A3);
impl_task_fn!(A1, A2, A3, A4);
impl_task_fn!(A1, A2, A3, A4, A5);
impl_task_fn!(A1, A2, A3, A4, A5, A6);

/// Adapter turning a [`TaskFn`] into a [`TaskHandler`]
///
/// The parameter list is captured once at registration; every invocation
/// checks arity against it before coercing.
pub struct FnHandler<F, Args> {
    func: Arc<F>,
    param_types: Vec<&'static str>,
    _args: PhantomData<fn() -> Args>,
}

impl<F, Args> FnHandler<F, Args>
where
    F: TaskFn<Args>,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Arc::new(func),
            param_types: <F as TaskFn<Args>>::param_types(),
            _args: PhantomData,
        }
    }

    /// Number of declared parameters
    pub fn arity(&self) -> usize {
        self.param_types.len()
    }
}

#[async_trait]
impl<F, Args> TaskHandler for FnHandler<F, Args>
where
    F: TaskFn<Args>,
{
    async fn invoke(&self, message: &TaskMessage) -> TaskResult<Value> {
        if message.args.is_empty() && !message.kwargs.is_empty() && self.arity() > 0 {
            return Err(TaskError::argument(format!(
                "{} takes positional arguments ({})",
                message.task,
                self.param_types.join(", ")
            )));
        }
        if message.args.len() != self.arity() {
            return Err(TaskError::argument(format!(
                "{} takes {} arguments ({}), got {}",
                message.task,
                self.arity(),
                self.param_types.join(", "),
                message.args.len()
            )));
        }

        let func = self.func.clone();
        let args = message.args.clone();
        tokio::task::spawn_blocking(move || func.call(args))
            .await
            .map_err(|e| join_failure(&message.task, e))?
    }
}

/// Registry mapping task names to handlers
///
/// Lookups take a read lock, so tasks may be registered while the worker
/// pool is running; the last registration under a name wins.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`
    pub async fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        let mut handlers = self.handlers.write().await;
        if handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!("Task {} registered again, replacing previous handler", name);
        } else {
            info!("Registered task {}", name);
        }
    }

    /// Register a structured task built with `T::default()` per invocation
    pub async fn register_task<T>(&self, name: impl Into<String>)
    where
        T: CeleryTask + Default,
    {
        self.register(name, StructuredHandler::new(T::default)).await;
    }

    /// Register a structured task built by `factory` per invocation
    pub async fn register_task_with<T, F>(&self, name: impl Into<String>, factory: F)
    where
        T: CeleryTask,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register(name, StructuredHandler::new(factory)).await;
    }

    /// Register a plain callable
    pub async fn register_fn<F, Args>(&self, name: impl Into<String>, func: F)
    where
        F: TaskFn<Args>,
        Args: 'static,
    {
        self.register(name, FnHandler::new(func)).await;
    }

    /// Handler registered under `name`
    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    /// Look up and invoke the task named by `message`
    pub async fn invoke(&self, message: &TaskMessage) -> TaskResult<Value> {
        let handler = self
            .get(&message.task)
            .await
            .ok_or_else(|| TaskError::task_not_found(message.task.clone()))?;

        debug!("Invoking {} for task {}", message.task, message.id);
        handler.invoke(message).await
    }

    /// Registered task names
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tasks
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}
