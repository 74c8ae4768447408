//! Restart loop for long-lived global tasks

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Pause before a failed task is started again
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(1);

/// Run `factory()` until shutdown, restarting it after [`RESTART_COOLDOWN`]
/// whenever it returns (with or without an error) or panics.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    shutdown: &broadcast::Sender<()>,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            let mut task = tokio::spawn(factory());
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    task.abort();
                    log::debug!("{} stopped", name);
                    return;
                }
                outcome = &mut task => match outcome {
                    Ok(Ok(())) => log::warn!("{} exited, restarting", name),
                    Ok(Err(e)) => log::error!("{} failed: {}, restarting", name, e),
                    Err(e) if e.is_panic() => log::error!("{} panicked, restarting", name),
                    Err(_) => return,
                },
            }
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(RESTART_COOLDOWN) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_cooldown() {
        let (shutdown, _) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_supervised("flaky", &shutdown, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::Error::Transport("boom".into()))
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(RESTART_COOLDOWN).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        shutdown.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_running_task() {
        let (shutdown, _) = broadcast::channel(1);
        let handle = spawn_supervised("forever", &shutdown, || async {
            std::future::pending::<()>().await;
            Ok(())
        });
        tokio::task::yield_now().await;
        shutdown.send(()).unwrap();
        handle.await.unwrap();
    }
}
