//! Single-assignment deferred values.
//!
//! An [`Output`] is a cell whose value becomes available at some later
//! point, typically when the provider finishes creating the resource that
//! produces it. Cells are cheap to clone; every clone observes the same
//! cached resolution. Derived cells (via [`Output::map`], [`Output::zip`],
//! [`Output::all`] and friends) inherit the provenance of their sources, so
//! the graph builder can recover data-flow edges without evaluating anything.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

/// Result carried by a cell once it settles.
pub type CellResult<T> = std::result::Result<T, CellError>;

/// Failure carried by a cell.
///
/// Cloneable so that every consumer of a shared cell observes the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{origin}: {message}")]
pub struct CellError {
    /// The resource or function the failure originated from.
    pub origin: String,
    /// Description of the failure.
    pub message: String,
}

impl CellError {
    /// Creates a new cell error.
    #[must_use]
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            message: message.into(),
        }
    }
}

/// A deferred, single-assignment value.
pub struct Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    future: Shared<BoxFuture<'static, CellResult<T>>>,
    dependencies: Arc<BTreeSet<String>>,
    secret: bool,
}

impl<T> Clone for Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
            dependencies: Arc::clone(&self.dependencies),
            secret: self.secret,
        }
    }
}

impl<T> fmt::Debug for Output<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Output");
        s.field("dependencies", &self.dependencies);
        if self.secret {
            s.field("value", &"[secret]");
        } else {
            s.field("value", &self.peek());
        }
        s.finish()
    }
}

impl<T> Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cell that is already resolved.
    #[must_use]
    pub fn known(value: T) -> Self {
        Self::from_future(future::ready(Ok(value)), BTreeSet::new(), false)
    }

    /// Creates a cell that has already failed.
    #[must_use]
    pub fn failed(error: CellError) -> Self {
        Self::from_future(future::ready(Err(error)), BTreeSet::new(), false)
    }

    /// Creates an unresolved cell produced by `source`, together with the
    /// resolver that settles it.
    ///
    /// Dropping the resolver without firing it fails the cell, so consumers
    /// never wait forever.
    #[must_use]
    pub fn pending(source: impl Into<String>) -> (Self, OutputResolver<T>) {
        let source = source.into();
        let (sender, receiver) = oneshot::channel();
        let origin = source.clone();
        let future = async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(CellError::new(origin, "value was never resolved")))
        };

        let dependencies = BTreeSet::from([source.clone()]);
        (
            Self::from_future(future, dependencies, false),
            OutputResolver { sender, source },
        )
    }

    /// Wraps an arbitrary future as a cell with the given provenance.
    ///
    /// The future runs at most once, the first time the cell is awaited.
    #[must_use]
    pub fn from_future<F>(future: F, dependencies: BTreeSet<String>, secret: bool) -> Self
    where
        F: Future<Output = CellResult<T>> + Send + 'static,
    {
        Self {
            future: future.boxed().shared(),
            dependencies: Arc::new(dependencies),
            secret,
        }
    }

    /// Derives a cell whose value is `f` applied to this cell's value.
    ///
    /// `f` runs at most once, and never if this cell fails.
    #[must_use]
    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.future.clone();
        self.derive(async move { source.await.map(f) })
    }

    /// Derives a cell through a fallible function.
    #[must_use]
    pub fn try_map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> CellResult<U> + Send + 'static,
    {
        let source = self.future.clone();
        self.derive(async move { source.await.and_then(f) })
    }

    /// Derives a cell through an asynchronous function.
    #[must_use]
    pub fn and_then<U, F, Fut>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = CellResult<U>> + Send + 'static,
    {
        let source = self.future.clone();
        self.derive(async move {
            let value = source.await?;
            f(value).await
        })
    }

    /// Joins two cells into a cell of the pair.
    #[must_use]
    pub fn zip<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let left = self.future.clone();
        let right = other.future.clone();
        let mut dependencies = (*self.dependencies).clone();
        dependencies.extend(other.dependencies.iter().cloned());

        Output::from_future(
            future::try_join(left, right),
            dependencies,
            self.secret || other.secret,
        )
    }

    /// Joins any number of cells into a cell of their values, in order.
    ///
    /// The first failure among the inputs becomes the failure of the result.
    #[must_use]
    pub fn all(outputs: impl IntoIterator<Item = Self>) -> Output<Vec<T>> {
        let mut dependencies = BTreeSet::new();
        let mut secret = false;
        let mut futures = Vec::new();
        for output in outputs {
            dependencies.extend(output.dependencies.iter().cloned());
            secret |= output.secret;
            futures.push(output.future);
        }

        Output::from_future(future::try_join_all(futures), dependencies, secret)
    }

    /// Waits for the cell to settle.
    ///
    /// # Errors
    ///
    /// Returns the cell's failure if it, or anything it derives from, failed.
    pub async fn resolve(&self) -> CellResult<T> {
        self.future.clone().await
    }

    /// Returns the settled value without waiting.
    ///
    /// Only cells that have already been awaited to completion report a value.
    #[must_use]
    pub fn peek(&self) -> Option<CellResult<T>> {
        self.future.peek().cloned()
    }

    /// Returns true once the cell has been observed to settle.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.future.peek().is_some()
    }

    /// Logical names of the resources this cell waits on.
    #[must_use]
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Adds a resource to this cell's provenance.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.dependencies).insert(name.into());
        self
    }

    /// Marks the cell as secret. Secrecy propagates to derived cells.
    #[must_use]
    pub const fn as_secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Returns true if the value must not be displayed.
    #[must_use]
    pub const fn is_secret(&self) -> bool {
        self.secret
    }

    fn derive<U, F>(&self, future: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Future<Output = CellResult<U>> + Send + 'static,
    {
        Output {
            future: future.boxed().shared(),
            dependencies: Arc::clone(&self.dependencies),
            secret: self.secret,
        }
    }
}

/// Write end of a pending [`Output`].
pub struct OutputResolver<T> {
    sender: oneshot::Sender<CellResult<T>>,
    source: String,
}

impl<T> fmt::Debug for OutputResolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputResolver")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl<T> OutputResolver<T> {
    /// The resource this resolver settles.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Settles the cell with a value.
    pub fn resolve(self, value: T) {
        // Nobody holding the cell any more is fine.
        let _ = self.sender.send(Ok(value));
    }

    /// Settles the cell with a failure.
    pub fn reject(self, message: impl Into<String>) {
        let error = CellError::new(self.source, message);
        let _ = self.sender.send(Err(error));
    }
}
