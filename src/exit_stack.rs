use crate::exit_error::ExitError;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, error, warn};

type CallbackFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A resource with a synchronous exit operation.
///
/// `exit` receives the error currently in flight (if any) and returns
/// `Ok(true)` to suppress it.
pub trait ScopedExit: Send {
    fn exit(&mut self, pending: Option<&ExitError>) -> Result<bool>;
}

/// A resource with an asynchronous exit operation.
#[async_trait]
pub trait AsyncScopedExit: Send {
    async fn exit(&mut self, pending: Option<&ExitError>) -> Result<bool>;
}

/// A resource with paired enter/exit operations.
pub trait Scope: ScopedExit + Sized + 'static {
    type Entered;

    fn enter(&mut self) -> Result<Self::Entered>;
}

/// A resource with paired asynchronous enter/exit operations.
#[async_trait]
pub trait AsyncScope: AsyncScopedExit + Sized + 'static {
    type Entered: Send;

    async fn enter(&mut self) -> Result<Self::Entered>;
}

/// Bare exit callable registered through [`ExitStack::push_fn`].
struct ExitFn<F>(Option<F>);

impl<F> ScopedExit for ExitFn<F>
where
    F: FnOnce(Option<&ExitError>) -> Result<bool> + Send,
{
    fn exit(&mut self, pending: Option<&ExitError>) -> Result<bool> {
        match self.0.take() {
            Some(exit) => exit(pending),
            None => Ok(false),
        }
    }
}

/// Bare asynchronous exit callable registered through
/// [`ExitStack::push_async_fn`].
struct AsyncExitFn<F>(Option<F>);

#[async_trait]
impl<F, Fut> AsyncScopedExit for AsyncExitFn<F>
where
    F: FnOnce(Option<ExitError>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn exit(&mut self, pending: Option<&ExitError>) -> Result<bool> {
        match self.0.take() {
            Some(exit) => exit(pending.cloned()).await,
            None => Ok(false),
        }
    }
}

/// A registered unit of deferred cleanup.
///
/// Whether an action suspends is fixed when it is registered.
enum ExitAction {
    /// Sees the in-flight error and may suppress it.
    Context(Box<dyn ScopedExit>),
    AsyncContext(Box<dyn AsyncScopedExit>),
    /// Runs with no error context; its result is discarded.
    Callback(Box<dyn FnOnce() -> Result<()> + Send>),
    AsyncCallback(Box<dyn FnOnce() -> CallbackFuture + Send>),
}

impl ExitAction {
    async fn invoke(self, pending: Option<&ExitError>) -> Result<bool> {
        match self {
            Self::Context(mut exit) => exit.exit(pending),
            Self::AsyncContext(mut exit) => exit.exit(pending).await,
            Self::Callback(callback) => callback().map(|()| false),
            Self::AsyncCallback(callback) => callback().await.map(|()| false),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Context(_) => "context",
            Self::AsyncContext(_) => "async-context",
            Self::Callback(_) => "callback",
            Self::AsyncCallback(_) => "async-callback",
        }
    }
}

impl fmt::Debug for ExitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Dynamic stack of exit actions, unwound in LIFO order.
///
/// Failures raised while unwinding are chained the way nested scoped blocks
/// would chain them: each new error records the error that was in flight
/// when it was raised, and the last one standing is returned to the caller.
///
/// ```no_run
/// use exitstack::{ExitError, ExitStack};
///
/// # async fn demo() -> Result<(), ExitError> {
/// let mut stack = ExitStack::new();
/// stack
///     .callback(|| Ok(println!("closed second")))
///     .callback(|| Ok(println!("closed first")));
/// let suppressed = stack.close().await?;
/// assert!(!suppressed);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ExitStack {
    actions: Vec<ExitAction>,
}

impl ExitStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Registers a resource's synchronous exit operation.
    pub fn push<X>(&mut self, resource: X) -> &mut Self
    where
        X: ScopedExit + 'static,
    {
        self.actions.push(ExitAction::Context(Box::new(resource)));
        self
    }

    /// Registers a resource's asynchronous exit operation.
    pub fn push_async<X>(&mut self, resource: X) -> &mut Self
    where
        X: AsyncScopedExit + 'static,
    {
        self.actions.push(ExitAction::AsyncContext(Box::new(resource)));
        self
    }

    /// Registers a bare exit callable. It sees the in-flight error and may
    /// return `Ok(true)` to suppress it.
    pub fn push_fn<F>(&mut self, exit: F) -> &mut Self
    where
        F: FnOnce(Option<&ExitError>) -> Result<bool> + Send + 'static,
    {
        self.push(ExitFn(Some(exit)))
    }

    /// Asynchronous variant of [`push_fn`](Self::push_fn). The callable
    /// receives its own copy of the in-flight error.
    pub fn push_async_fn<F, Fut>(&mut self, exit: F) -> &mut Self
    where
        F: FnOnce(Option<ExitError>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.push_async(AsyncExitFn(Some(exit)))
    }

    /// Registers a plain callback. Whatever it returns on success is
    /// discarded, so it can never suppress an error.
    pub fn callback<F, T>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: 'static,
    {
        self.actions
            .push(ExitAction::Callback(Box::new(move || callback().map(drop))));
        self
    }

    /// Registers a plain callback with pre-bound arguments.
    pub fn callback_with<F, A, T>(&mut self, callback: F, args: A) -> &mut Self
    where
        F: FnOnce(A) -> Result<T> + Send + 'static,
        A: Send + 'static,
        T: 'static,
    {
        self.callback(move || callback(args))
    }

    /// Registers an asynchronous plain callback.
    pub fn callback_async<F, Fut, T>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: 'static,
    {
        self.actions.push(ExitAction::AsyncCallback(Box::new(move || {
            Box::pin(async move { callback().await.map(drop) }) as CallbackFuture
        })));
        self
    }

    /// Enters `resource` and registers its exit operation.
    ///
    /// Nothing is registered if `enter` fails.
    pub fn enter_scope<S: Scope>(&mut self, mut resource: S) -> Result<S::Entered> {
        let entered = resource.enter()?;
        self.push(resource);
        Ok(entered)
    }

    /// Asynchronous variant of [`enter_scope`](Self::enter_scope).
    pub async fn enter_async_scope<S: AsyncScope>(&mut self, mut resource: S) -> Result<S::Entered> {
        let entered = resource.enter().await?;
        self.push_async(resource);
        Ok(entered)
    }

    /// Moves every registered action into a new stack, leaving this one
    /// empty. Nothing is invoked.
    pub fn pop_all(&mut self) -> ExitStack {
        ExitStack {
            actions: std::mem::take(&mut self.actions),
        }
    }

    /// Unwinds the stack with no error in flight.
    pub async fn close(&mut self) -> std::result::Result<bool, ExitError> {
        self.unwind(None).await
    }

    /// Runs every action in reverse registration order.
    ///
    /// `entry` is the error the guarded scope is exiting with. Each action
    /// sees the error in flight at the time it runs: the entry error, a
    /// failure raised by a later-registered action, or nothing after a
    /// suppression. A failure raised while another error is in flight is
    /// chained onto it.
    ///
    /// Returns the last unresolved failure, or whether `entry` was present
    /// and suppressed. The caller still owns `entry` and re-raises it when
    /// this returns `Ok(false)`.
    pub async fn unwind(&mut self, entry: Option<&ExitError>) -> std::result::Result<bool, ExitError> {
        let received = entry.is_some();
        let mut pending = entry.cloned();
        let mut suppressed = false;
        let mut pending_raise = false;

        debug!(
            "unwinding {} exit actions (error in flight: {})",
            self.actions.len(),
            received
        );

        while let Some(action) = self.actions.pop() {
            let kind = action.kind();
            match action.invoke(pending.as_ref()).await {
                Ok(true) => {
                    debug!("{} exit action suppressed the pending error", kind);
                    suppressed = true;
                    pending_raise = false;
                    pending = None;
                }
                Ok(false) => {}
                Err(report) => {
                    let mut raised = ExitError::from_report(report);
                    warn!("{} exit action failed: {}", kind, raised);
                    if let Some(previous) = pending.take() {
                        raised.link_context(previous, entry);
                    }
                    pending_raise = true;
                    pending = Some(raised);
                }
            }
        }

        match pending {
            Some(raised) if pending_raise => Err(raised),
            _ => Ok(received && suppressed),
        }
    }

    /// Ends a guarded scope with the outcome of its body.
    ///
    /// On success the stack is closed and the value returned. On failure the
    /// stack is unwound with the error: `Ok(None)` if an action suppressed
    /// it, otherwise the error itself or the cleanup failure chained onto it.
    pub async fn finish<T>(
        &mut self,
        outcome: std::result::Result<T, ExitError>,
    ) -> std::result::Result<Option<T>, ExitError> {
        match outcome {
            Ok(value) => {
                self.close().await?;
                Ok(Some(value))
            }
            Err(error) => {
                if self.unwind(Some(&error)).await? {
                    Ok(None)
                } else {
                    Err(error)
                }
            }
        }
    }
}

impl fmt::Debug for ExitStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitStack")
            .field("actions", &self.actions)
            .finish()
    }
}

impl Drop for ExitStack {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }

        // No runtime to await on here: run what can run synchronously.
        warn!(
            "exit stack dropped with {} pending actions, running synchronous ones",
            self.actions.len()
        );
        while let Some(action) = self.actions.pop() {
            let outcome = match action {
                ExitAction::Context(mut exit) => exit.exit(None).map(drop),
                ExitAction::Callback(callback) => callback(),
                ExitAction::AsyncContext(_) | ExitAction::AsyncCallback(_) => {
                    warn!("discarding asynchronous exit action during drop");
                    continue;
                }
            };
            if let Err(e) = outcome {
                error!("exit action failed during drop: {}", e);
            }
        }
    }
}
