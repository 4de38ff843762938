use crate::Result;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by every collaborator port, so the ports stay object-safe.
pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;
