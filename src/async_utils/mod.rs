//! Asynchronous utilities for use with Tokio.

use std::pin::Pin;

use futures::Future;

pub mod io;

/// A boxed, owned future.
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A boxed, owned stream.
pub type BoxedStream<T> =
    Pin<Box<dyn futures::Stream<Item = T> + Send + 'static>>;
