use std::future::Future;
use std::io;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SyncError;
use crate::settings::RetryPolicy;

/// Runs a filesystem operation until it succeeds or the policy's attempts are
/// used up. Backoff sleeps end early on cancellation.
pub(crate) async fn retry_io<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    path: &Path,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(source) if attempt >= max_attempts => {
                return Err(SyncError::Filesystem {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                })
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    path = %path.display(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Filesystem operation failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_io(&fast_policy(), &CancellationToken::new(), Path::new("x"), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(io::Error::new(io::ErrorKind::Other, "busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = retry_io(&fast_policy(), &CancellationToken::new(), Path::new("x"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(io::Error::new(io::ErrorKind::PermissionDenied, "denied")) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Filesystem { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let err = retry_io(&policy, &cancel, Path::new("x"), || async {
            Err::<(), _>(io::Error::new(io::ErrorKind::Other, "busy"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
