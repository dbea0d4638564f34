//! Single-assignment rendezvous shared between the cache-wide lock and
//! off-lock disk I/O, mirroring the teacher's use of `futures::Shared`
//! together with tokio to let many readers observe one producer's result
//! without re-entering the cache lock (see spec §9, "Design Notes").
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::CacheError;

/// Resolves to the decoded value once a load or write publishes it.
/// Cloning is cheap (an `Arc` bump); many concurrent callers can hold and
/// await the same future.
pub type ValueFuture<V> = Shared<BoxFuture<'static, Result<Arc<V>, Arc<CacheError>>>>;

pub type ValueSender<V> = oneshot::Sender<Result<Arc<V>, Arc<CacheError>>>;

/// Creates a not-yet-resolved [`ValueFuture`] and the sender used to publish
/// its result exactly once.
pub fn pending<V: Send + Sync + 'static>() -> (ValueSender<V>, ValueFuture<V>) {
    let (tx, rx) = oneshot::channel();
    let fut = async move {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Arc::new(CacheError::ProtocolError(
                "value producer dropped before publishing".into(),
            ))),
        }
    };
    (tx, fut.boxed().shared())
}
