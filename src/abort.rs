//! Cooperative cancellation helpers.
//!
//! Every suspension point checks the token before it starts and races the
//! in-flight future against it, so callers observe an abort promptly even
//! when the remote call is slow to return.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Returns `Err(Error::Aborted)` if the token has fired.
pub fn check(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Aborted)
    } else {
        Ok(())
    }
}

/// Runs `future` unless the token fires first.
///
/// The future is dropped when cancellation wins.
pub async fn race<T, F>(token: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    check(token)?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Aborted),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn check_passes_until_cancelled() {
        let token = CancellationToken::new();
        assert!(check(&token).is_ok());
        token.cancel();
        assert!(matches!(check(&token), Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn race_returns_future_output() {
        let token = CancellationToken::new();
        let value = race(&token, async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn race_does_not_poll_future_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let polled = std::sync::atomic::AtomicBool::new(false);
        let result: Result<()> = race(&token, async {
            polled.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Aborted)));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn race_aborts_slow_future() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = race(&token, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Aborted)));
    }
}
