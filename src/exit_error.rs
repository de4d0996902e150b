use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ERROR_ID: AtomicU64 = AtomicU64::new(1);

/// An error travelling through an [`ExitStack`](crate::ExitStack) unwind.
///
/// Each error has an identity that survives cloning, and an optional link to
/// the error that was in flight when it was raised. The link is diagnostic
/// only: it records nesting order, it does not own the predecessor's
/// resources.
#[derive(Clone)]
pub struct ExitError {
    id: u64,
    report: Arc<eyre::Report>,
    caused_by: Option<Box<ExitError>>,
}

impl ExitError {
    /// Wraps a concrete error type.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::from_report(eyre::Report::new(error))
    }

    /// Creates an error from a printable message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_report(eyre::Report::msg(message))
    }

    /// Converts a report into an exit error.
    ///
    /// A report whose outermost error is an `ExitError` (the failure of a
    /// nested stack, or an action re-raising what it was handed) is unwrapped
    /// so its identity and chain are kept. A report that adds context on top
    /// of one is a new failure.
    pub fn from_report(report: eyre::Report) -> Self {
        let outermost_is_exit = report
            .chain()
            .next()
            .is_some_and(|error| error.is::<ExitError>());
        if !outermost_is_exit {
            return Self::raised(report);
        }
        match report.downcast::<ExitError>() {
            Ok(nested) => nested,
            Err(report) => Self::raised(report),
        }
    }

    fn raised(report: eyre::Report) -> Self {
        Self {
            id: NEXT_ERROR_ID.fetch_add(1, Ordering::Relaxed),
            report: Arc::new(report),
            caused_by: None,
        }
    }

    /// The error that was in flight when this one was raised.
    pub fn caused_by(&self) -> Option<&ExitError> {
        self.caused_by.as_deref()
    }

    /// Iterates this error and every predecessor, newest first.
    pub fn chain(&self) -> impl Iterator<Item = &ExitError> {
        std::iter::successors(Some(self), |error| error.caused_by())
    }

    /// The underlying report.
    pub fn report(&self) -> &eyre::Report {
        &self.report
    }

    /// Attempts to view the wrapped error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.report.downcast_ref::<E>()
    }

    /// Whether both values are the same raised error.
    pub fn is(&self, other: &ExitError) -> bool {
        self.id == other.id
    }

    /// Records `previous` as the predecessor of this chain.
    ///
    /// Walks `caused_by` until it either finds `previous` (nothing to do) or
    /// reaches the end of the chain or a link to `frame`, the error that was
    /// current before the unwind began. That link is replaced with
    /// `previous`, whose own chain already leads back to `frame`.
    ///
    /// Nothing is linked if `previous` already leads back to this error (an
    /// older error re-raised), so the chain never loops.
    pub(crate) fn link_context(&mut self, previous: ExitError, frame: Option<&ExitError>) {
        if previous.chain().any(|error| error.is(self)) {
            return;
        }
        let relink = match self.caused_by.as_deref() {
            Some(link) if link.is(&previous) => return,
            Some(link) => frame.is_some_and(|frame| link.is(frame)),
            None => true,
        };
        if relink {
            self.caused_by = Some(Box::new(previous));
        } else if let Some(link) = self.caused_by.as_deref_mut() {
            link.link_context(previous, frame);
        }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.report)
    }
}

impl fmt::Debug for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitError")
            .field("id", &self.id)
            .field("error", &format_args!("{}", self.report))
            .field("caused_by", &self.caused_by)
            .finish()
    }
}

impl StdError for ExitError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.caused_by
            .as_deref()
            .map(|error| error as &(dyn StdError + 'static))
    }
}

impl From<eyre::Report> for ExitError {
    fn from(report: eyre::Report) -> Self {
        Self::from_report(report)
    }
}
