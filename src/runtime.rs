use std::time::Duration;

use crate::error::{Error, Result};

/// Run a synchronous engine call on the blocking pool under a timeout.
///
/// On timeout the caller stops waiting; the blocking task itself runs to
/// completion in the background.
pub async fn bounded<T, F>(
    operation: &'static str,
    timeout_ms: u64,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(Error::ServiceUnavailable(format!(
            "{operation} task failed: {join}"
        ))),
        Err(_) => Err(Error::Timeout {
            operation,
            timeout_ms,
        }),
    }
}
