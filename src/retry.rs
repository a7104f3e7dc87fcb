use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::error;

pub struct RetryOptions<'a> {
    pub task: &'a str,
    pub max_attempts: u32,
    pub delay_between_attempts: Duration,
    pub hide_errors: bool,
}

/// Retries `f` with a constant wait between attempts, returning the last
/// error once `max_attempts` is exhausted.
pub async fn retry_with_constant_wait<F, Fut, T, E>(
    options: RetryOptions<'_>,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= options.max_attempts {
                    error!(
                        "[{}] failed after [{}] attempts - giving up: {}",
                        options.task, attempt, e
                    );
                    return Err(e);
                }

                if !options.hide_errors {
                    error!(
                        "[{}] attempt [{}] failed with [{}] - retrying in {:?}",
                        options.task, attempt, e, options.delay_between_attempts
                    );
                }

                tokio::time::sleep(options.delay_between_attempts).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options(max_attempts: u32) -> RetryOptions<'static> {
        RetryOptions {
            task: "test",
            max_attempts,
            delay_between_attempts: Duration::from_millis(1),
            hide_errors: true,
        }
    }

    #[tokio::test]
    async fn returns_on_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_constant_wait(options(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_constant_wait(options(5), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_constant_wait(options(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
