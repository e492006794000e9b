//! Acquisition bound to a scope.
//!
//! [`LiveValue`] is itself the guard: its `Drop` releases. The helpers here
//! keep the handle inside the scope so the body cannot skip the release by
//! returning early, failing, panicking or being cancelled.

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::{Result, TransportError};
use crate::live_value::LiveValue;
use crate::multiplexer::Multiplexer;
use crate::types::FunctionRef;

impl Multiplexer {
    /// Acquires `query(args)`, runs `body` with the handle and releases it
    /// when `body` finishes or the returned future is dropped.
    pub async fn with_live_query<A, T, F>(&self, query: &FunctionRef, args: &A, body: F) -> Result<T>
    where
        A: Serialize + ?Sized,
        F: for<'a> FnOnce(&'a LiveValue) -> BoxFuture<'a, T>,
    {
        let live = self.acquire(query, args).await?;
        let output = body(&live).await;
        live.release();
        Ok(output)
    }

    /// Like [`Multiplexer::with_live_query`] for bodies that fail with their
    /// own error type.
    pub async fn try_with_live_query<A, T, E, F>(
        &self,
        query: &FunctionRef,
        args: &A,
        body: F,
    ) -> std::result::Result<T, E>
    where
        A: Serialize + ?Sized,
        E: From<TransportError>,
        F: for<'a> FnOnce(&'a LiveValue) -> BoxFuture<'a, std::result::Result<T, E>>,
    {
        let live = self.acquire(query, args).await?;
        let output = body(&live).await;
        live.release();
        output
    }
}
