//! Ordered success/failure handler pairs for the request and response chains.
//!
//! A registry only stores handlers. Composition is explicit: [`InterceptorRegistry::chain`]
//! snapshots the live handlers in a [`ChainDirection`] and [`run_chain`] folds
//! them over a starting value, mirroring `then(on_success, on_failure)`
//! semantics: a success value goes to the next `on_success`, a failure goes to
//! the next `on_failure`, and a missing handler passes its input through.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::SyncwireResult;
use crate::error::Error;

pub type SuccessHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, SyncwireResult<T>> + Send + Sync>;
pub type FailureHandler<T> =
    Arc<dyn Fn(Error) -> BoxFuture<'static, SyncwireResult<T>> + Send + Sync>;

/// Stable handle returned by [`InterceptorRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterceptorId(usize);

impl InterceptorId {
    pub const fn index(self) -> usize {
        self.0
    }
}

pub struct Interceptor<T> {
    on_success: Option<SuccessHandler<T>>,
    on_failure: Option<FailureHandler<T>>,
}

impl<T> Clone for Interceptor<T> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}

impl<T> Default for Interceptor<T> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_failure: None,
        }
    }
}

impl<T> std::fmt::Debug for Interceptor<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Interceptor")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

impl<T: Send + 'static> Interceptor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncwireResult<T>> + Send + 'static,
    {
        let wrapped: SuccessHandler<T> = Arc::new(move |value: T| handler(value).boxed());
        self.on_success = Some(wrapped);
        self
    }

    pub fn on_failure<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncwireResult<T>> + Send + 'static,
    {
        let wrapped: FailureHandler<T> = Arc::new(move |error: Error| handler(error).boxed());
        self.on_failure = Some(wrapped);
        self
    }

    async fn apply(&self, state: SyncwireResult<T>) -> SyncwireResult<T> {
        match state {
            Ok(value) => match &self.on_success {
                Some(handler) => handler(value).await,
                None => Ok(value),
            },
            Err(error) => match &self.on_failure {
                Some(handler) => handler(error).await,
                None => Err(error),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainDirection {
    /// Last registered runs first. Used for outgoing requests so that later
    /// interceptors wrap earlier ones.
    Reverse,
    /// First registered runs first. Used for responses, unwinding in the
    /// opposite order from requests.
    Forward,
}

pub struct InterceptorRegistry<T> {
    slots: Vec<Option<Interceptor<T>>>,
}

impl<T> Default for InterceptorRegistry<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> std::fmt::Debug for InterceptorRegistry<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InterceptorRegistry")
            .field("registered", &self.slots.len())
            .field("live", &self.len())
            .finish()
    }
}

impl<T> InterceptorRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interceptor: Interceptor<T>) -> InterceptorId {
        self.slots.push(Some(interceptor));
        InterceptorId(self.slots.len() - 1)
    }

    /// Leaves a tombstone in place so later ids keep pointing at their handlers.
    pub fn remove(&mut self, id: InterceptorId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Tombstones every slot; ids handed out so far are never reissued.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn for_each(&self, mut visit: impl FnMut(InterceptorId, &Interceptor<T>)) {
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(interceptor) = slot {
                visit(InterceptorId(index), interceptor);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chain(&self, direction: ChainDirection) -> Vec<Interceptor<T>> {
        let mut handlers = Vec::with_capacity(self.slots.len());
        self.for_each(|_, interceptor| handlers.push(interceptor.clone()));
        if direction == ChainDirection::Reverse {
            handlers.reverse();
        }
        handlers
    }
}

pub async fn run_chain<T>(chain: &[Interceptor<T>], initial: SyncwireResult<T>) -> SyncwireResult<T>
where
    T: Send + 'static,
{
    let mut state = initial;
    for interceptor in chain {
        state = interceptor.apply(state).await;
    }
    state
}
