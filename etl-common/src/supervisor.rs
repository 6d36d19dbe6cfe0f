use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

/// Keep a worker loop running until shutdown.
///
/// Per-record failures are handled inside the workers; only systemic errors
/// (loss of a transport, an aborted batch) escape their run loops. Those get
/// logged, counted, and the worker is restarted after a pause with its cursor
/// state intact, resuming at-least-once from the last acknowledged position.
pub async fn supervise<F, Fut, E>(
    name: &str,
    mut shutdown: watch::Receiver<bool>,
    restart_pause: Duration,
    mut run: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    loop {
        match run().await {
            Ok(()) => {
                info!("{name} stopped");
                return;
            }
            Err(error) => {
                error!("{name} failed, restarting: {error}");
                let labels = [("worker", name.to_owned())];
                metrics::counter!("etl_worker_restarts_total", &labels).increment(1);

                tokio::select! {
                    _ = tokio::time::sleep(restart_pause) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    info!("{name} stopped during restart pause");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_supervisor_restarts_failing_worker() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicU32::new(0));

        let counted = runs.clone();
        let supervisor = supervise(
            "test-worker",
            rx,
            Duration::from_millis(1),
            move || {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("boom")
                    } else {
                        Ok(())
                    }
                }
            },
        );

        tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_supervisor_honors_shutdown_during_pause() {
        let (tx, rx) = watch::channel(false);

        let supervisor = supervise(
            "test-worker",
            rx,
            Duration::from_secs(600),
            || async { Err::<(), _>("boom") },
        );
        tokio::pin!(supervisor);

        // The worker fails immediately and the supervisor parks in its pause.
        tokio::select! {
            _ = &mut supervisor => panic!("supervisor should be pausing"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .unwrap();
    }
}
