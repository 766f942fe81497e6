use crate::error::{Result, StrataError};
use futures::future::join_all;
use std::future::Future;
use tokio::task::JoinHandle;

/// A handle to a non-blocking send.
///
/// Transports that hand the payload off synchronously return an already
/// completed request; others run the send in a spawned task. If dropped
/// without calling `wait()`, a pending send is aborted.
pub struct Request {
    task: Option<JoinHandle<Result<()>>>,
}

impl Request {
    /// A request whose operation has already finished.
    pub fn completed() -> Self {
        Self { task: None }
    }

    /// Run `fut` in the background and return a handle to it.
    pub fn spawn(fut: impl Future<Output = Result<()>> + Send + 'static) -> Self {
        Self {
            task: Some(tokio::spawn(fut)),
        }
    }

    /// Wait for the operation to complete and propagate any error.
    pub async fn wait(mut self) -> Result<()> {
        match self.task.take() {
            None => Ok(()),
            Some(handle) => handle
                .await
                .map_err(|e| StrataError::transport_with_source("send task failed", e))?,
        }
    }

    /// Check if the operation has finished (non-blocking).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(handle) = &self.task {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Wait for every request and return the first error, if any.
///
/// All requests are awaited regardless of errors.
pub async fn wait_all(requests: impl IntoIterator<Item = Request>) -> Result<()> {
    let results = join_all(requests.into_iter().map(Request::wait)).await;
    let mut first_err = None;
    for r in results {
        if let Err(e) = r
            && first_err.is_none()
        {
            first_err = Some(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
