use std::{future::Future, time::Duration};

use crate::error::{Error, Result};

/// Outcome of a single poll.
#[derive(Debug)]
pub(crate) enum Poll<T> {
    /// Terminal state reached; the caller decides whether it is a success.
    Ready(T),

    /// Still pending, poll again after the delay.
    Pending,
}

/// Calls `poll` until it is ready, at most `max_attempts` times with `delay` in between.
///
/// Running out of attempts is [`Error::PollExhausted`].
pub(crate) async fn poll_until<T, F, Fut>(
    what: &str,
    max_attempts: u32,
    delay: Duration,
    mut poll: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    for attempt in 1..=max_attempts {
        match poll().await? {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending => {
                log::debug!("{what} pending after attempt {attempt}/{max_attempts}");

                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(Error::PollExhausted {
        what: what.to_owned(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ready_on_last_attempt_succeeds() {
        let calls = AtomicU32::new(0);

        let value = poll_until("authorization", 5, Duration::from_secs(2), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n < 5 { Poll::Pending } else { Poll::Ready(n) })
        })
        .await
        .unwrap();

        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_on_every_attempt_is_exhausted() {
        let calls = AtomicU32::new(0);

        let err = poll_until::<(), _, _>("order", 5, Duration::from_secs(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Poll::Pending)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::PollExhausted { attempts: 5, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_stop_polling() {
        let calls = AtomicU32::new(0);

        let err = poll_until::<(), _, _>("order", 5, Duration::from_secs(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::protocol("boom"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
