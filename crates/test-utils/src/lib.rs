//! Shared helpers for engine integration tests.
//!
//! - [`engine_test!`] defines a multi-threaded async test that returns
//!   `anyhow::Result`, with tracing initialized and a hard deadline.
//! - [`wait_until`] polls a condition until it yields a value.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};

/// Upper bound for a single engine test, so a lost wakeup fails instead of hanging.
pub const TEST_DEADLINE: Duration = Duration::from_secs(30);

/// Initialize tracing for tests. Safe to call multiple times.
///
/// Honors `RUST_LOG` when set, otherwise logs the engine at debug level.
/// `try_init()` makes later calls no-ops.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sagaflow=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Poll until `check` returns `Some(T)` or `timeout` expires.
pub async fn wait_until<F, Fut, T>(timeout: Duration, interval: Duration, check: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(result) = check().await? {
            return Ok(result);
        }

        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timeout waiting for condition"));
        }

        tokio::time::sleep(interval).await;
    }
}

/// Run a test body under [`TEST_DEADLINE`].
pub async fn with_deadline<F>(test_name: &str, body: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::time::timeout(TEST_DEADLINE, body)
        .await
        .map_err(|_| anyhow!("{test_name} exceeded {TEST_DEADLINE:?}"))?
}

/// Define an async engine test.
///
/// Usage:
///
/// ```ignore
/// use test_utils::engine_test;
///
/// engine_test!(confirmed_subscription_gets_welcome_mail, {
///     let app = TestApp::new()?;
///     app.process.submit_form(id).await?;
///     Ok(())
/// });
/// ```
///
/// This expands to:
/// - `#[tokio::test(flavor = "multi_thread")]`
/// - a call to [`init_test_tracing`]
/// - the body wrapped in [`with_deadline`]
#[macro_export]
macro_rules! engine_test {
    ($name:ident, $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() -> anyhow::Result<()> {
            $crate::init_test_tracing();
            $crate::with_deadline(stringify!($name), async move { $body }).await
        }
    };
}
