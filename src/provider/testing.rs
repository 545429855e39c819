//! Provider wrappers for tests: call recording, fault injection and
//! concurrency tracking around an inner provider.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;

use super::memory::InMemoryProvider;
use super::traits::{Operation, Provider, ProviderResponse, ProviderResult, ResourceRequest};

/// Records every call and injects failures before delegating.
pub struct RecordingProvider {
    inner: Arc<InMemoryProvider>,
    calls: Mutex<Vec<(Operation, String)>>,
    scripted: Mutex<HashMap<(Operation, String), VecDeque<ProviderError>>>,
    always_fail: Mutex<HashSet<(Operation, String)>>,
    after_commit: Mutex<HashMap<(Operation, String), VecDeque<ProviderError>>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingProvider {
    pub fn new(inner: Arc<InMemoryProvider>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashSet::new()),
            after_commit: Mutex::new(HashMap::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues `errors` to be returned, in order, by the next calls of
    /// `operation` on `name`.
    pub fn fail_next(&self, operation: Operation, name: &str, errors: Vec<ProviderError>) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((operation, name.to_string()))
            .or_default()
            .extend(errors);
    }

    /// Queues `errors` to be returned after the inner provider has already
    /// carried out the next calls of `operation` on `name`, as when a
    /// response is lost on the way back.
    pub fn fail_after_commit(&self, operation: Operation, name: &str, errors: Vec<ProviderError>) {
        self.after_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((operation, name.to_string()))
            .or_default()
            .extend(errors);
    }

    /// Makes every call of `operation` on `name` fail fatally.
    pub fn fail_always(&self, operation: Operation, name: &str) {
        self.always_fail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((operation, name.to_string()));
    }

    pub fn calls(&self) -> Vec<(Operation, String)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Logical names passed to `operation`, in call order.
    pub fn names_for(&self, operation: Operation) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| *op == operation)
            .map(|(_, name)| name)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryProvider {
        &self.inner
    }

    async fn enter(&self, operation: Operation, name: &str) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((operation, name.to_string()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let key = (operation, name.to_string());
        if self
            .always_fail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
        {
            return Err(ProviderError::Rejected {
                status: 400,
                message: format!("{operation} {name} rejected"),
            });
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        scripted.map_or(Ok(()), Err)
    }

    fn leave(&self, operation: Operation, name: &str) -> ProviderResult<()> {
        let lost = self
            .after_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&(operation, name.to_string()))
            .and_then(VecDeque::pop_front);
        lost.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        self.enter(Operation::Create, &request.name).await?;
        let response = self.inner.create(request).await?;
        self.leave(Operation::Create, &request.name)?;
        Ok(response)
    }

    async fn read(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        self.enter(Operation::Read, &request.name).await?;
        self.inner.read(request).await
    }

    async fn update(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        self.enter(Operation::Update, &request.name).await?;
        let response = self.inner.update(request).await?;
        self.leave(Operation::Update, &request.name)?;
        Ok(response)
    }

    async fn delete(&self, request: &ResourceRequest) -> ProviderResult<()> {
        self.enter(Operation::Delete, &request.name).await?;
        self.inner.delete(request).await
    }

    async fn invoke(&self, token: &str, args: &Value) -> ProviderResult<Value> {
        self.enter(Operation::Invoke, token).await?;
        self.inner.invoke(token, args).await
    }
}
