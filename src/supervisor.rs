//! Keeps a listener serving across faults by rebinding with backoff.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use tokio::time::{sleep, Instant};

/// Backoff policy for listener restarts.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Delay before the first rebind attempt after a fault.
    pub initial_backoff: Duration,
    /// Upper bound the delay doubles up to.
    pub max_backoff: Duration,
    /// A listener that served at least this long resets the delay.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Runs `serve` over listeners produced by `bind`, rebinding after faults.
///
/// The initial bind failure is fatal and propagates to the caller; any later
/// fault (from the serving loop or a rebind) is logged and retried after the
/// current backoff delay. `serve` consumes the listener, so the old socket is
/// dropped before a new one is bound. `serve` returning `Ok` ends
/// supervision.
pub async fn supervise<L, B, BFut, S, SFut>(
    name: &str,
    policy: RestartPolicy,
    mut bind: B,
    mut serve: S,
) -> Result<()>
where
    B: FnMut() -> BFut,
    BFut: Future<Output = Result<L>>,
    S: FnMut(L) -> SFut,
    SFut: Future<Output = Result<()>>,
{
    let mut listener = bind().await?;
    let mut backoff = policy.initial_backoff;
    loop {
        let started = Instant::now();
        match serve(listener).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if started.elapsed() >= policy.stable_after {
                    backoff = policy.initial_backoff;
                }
                warn!("{} failed: {:#}, rebinding in {:?}", name, err, backoff);
            }
        }
        listener = loop {
            sleep(backoff).await;
            backoff = (backoff * 2).min(policy.max_backoff);
            match bind().await {
                Ok(listener) => break listener,
                Err(err) => {
                    warn!("{} rebind failed: {:#}, retrying in {:?}", name, err, backoff);
                }
            }
        };
        info!("{} listening again", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RestartPolicy {
        RestartPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            stable_after: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn restarts_serving_after_a_fault() {
        let binds = Arc::new(AtomicUsize::new(0));
        let serves = Arc::new(AtomicUsize::new(0));
        let binds_in = binds.clone();
        let serves_in = serves.clone();

        supervise(
            "test listener",
            fast_policy(),
            move || {
                binds_in.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(()) }
            },
            move |()| {
                let attempt = serves_in.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(anyhow::anyhow!("injected fault"))
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(binds.load(Ordering::SeqCst), 2);
        assert_eq!(serves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn initial_bind_failure_is_fatal() {
        let result = supervise(
            "test listener",
            fast_policy(),
            || async { Err::<(), _>(anyhow::anyhow!("address in use")) },
            |()| async { anyhow::Ok(()) },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rebind_failures_are_retried() {
        let binds = Arc::new(AtomicUsize::new(0));
        let serves = Arc::new(AtomicUsize::new(0));
        let binds_in = binds.clone();
        let serves_in = serves.clone();

        supervise(
            "test listener",
            fast_policy(),
            move || {
                let attempt = binds_in.fetch_add(1, Ordering::SeqCst);
                async move {
                    // the first rebind after the fault fails, then recovers
                    if attempt == 1 {
                        Err(anyhow::anyhow!("transient bind failure"))
                    } else {
                        Ok(())
                    }
                }
            },
            move |()| {
                let attempt = serves_in.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(anyhow::anyhow!("injected fault"))
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(binds.load(Ordering::SeqCst), 3);
        assert_eq!(serves.load(Ordering::SeqCst), 2);
    }
}
