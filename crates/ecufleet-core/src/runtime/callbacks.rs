// ── Status and heartbeat subscribers ──

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

/// Failure reported by a subscriber callback. Logged, never propagated.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

type Callback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), CallbackError>> + Send + Sync>;

/// Ordered list of async callbacks receiving a cloned payload.
pub(crate) struct CallbackList<T> {
    name: &'static str,
    callbacks: RwLock<Vec<Callback<T>>>,
}

impl<T: Clone + Send + 'static> CallbackList<T> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn register<F, Fut>(&self, callback: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.callbacks
            .write()
            .push(Arc::new(move |payload| callback(payload).boxed()));
    }

    /// Run every callback in registration order. Errors and panics are
    /// logged and do not stop the remaining callbacks.
    pub(crate) async fn notify(&self, device_id: &str, payload: &T) {
        let callbacks = self.callbacks.read().clone();
        for (index, callback) in callbacks.iter().enumerate() {
            let payload = payload.clone();
            let Ok(future) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) else {
                warn!(device_id, callback = self.name, index, "callback panicked");
                continue;
            };
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(device_id, callback = self.name, index, error = %e, "callback failed");
                }
                Err(_) => warn!(device_id, callback = self.name, index, "callback panicked"),
            }
        }
    }
}
