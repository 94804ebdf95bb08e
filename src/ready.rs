//! Counted rendezvous for fan-out/fan-in.
//!
//! A [`ReadySignal`] created for `N` completions fires its [`ReadyWait`]
//! exactly once: after the `N`th success, or on the first failure. A count of
//! zero fires immediately.

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct ReadyState {
    remaining: usize,
    tx: Option<oneshot::Sender<Result<()>>>,
}

/// Counting side of the rendezvous. Cheap to clone into each fan-out branch.
#[derive(Clone)]
pub struct ReadySignal {
    state: Arc<Mutex<ReadyState>>,
}

/// Waiting side of the rendezvous.
#[derive(Debug)]
pub struct ReadyWait {
    rx: oneshot::Receiver<Result<()>>,
}

impl ReadySignal {
    /// Create a signal expecting `count` completions.
    pub fn new(count: usize) -> (Self, ReadyWait) {
        let (tx, rx) = oneshot::channel();
        let signal = Self {
            state: Arc::new(Mutex::new(ReadyState {
                remaining: count,
                tx: Some(tx),
            })),
        };
        if count == 0 {
            signal.fire(Ok(()));
        }
        (signal, ReadyWait { rx })
    }

    /// Record one successful completion.
    pub fn signal(&self) {
        self.complete(Ok(()));
    }

    /// Record one completion. The first error fires the wait immediately.
    pub fn complete(&self, result: Result<()>) {
        let fire = {
            let mut state = self.state.lock();
            if state.tx.is_none() {
                return;
            }
            match result {
                Ok(()) => {
                    state.remaining = state.remaining.saturating_sub(1);
                    (state.remaining == 0).then_some(Ok(()))
                }
                Err(err) => Some(Err(err)),
            }
        };
        if let Some(result) = fire {
            self.fire(result);
        }
    }

    /// Completions still outstanding.
    pub fn remaining(&self) -> usize {
        self.state.lock().remaining
    }

    /// Whether the wait has already been fired.
    pub fn is_fired(&self) -> bool {
        self.state.lock().tx.is_none()
    }

    fn fire(&self, result: Result<()>) {
        let tx = self.state.lock().tx.take();
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReadySignal")
            .field("remaining", &state.remaining)
            .field("fired", &state.tx.is_none())
            .finish()
    }
}

impl ReadyWait {
    /// Resolve once every completion arrived or the first one failed.
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .unwrap_or(Err(Error::Disconnected("ready signal")))
    }
}

/// Run every future as its own task and collect the results in input order.
///
/// The first failure is returned as soon as it happens. Sibling tasks that
/// are already running are not cancelled; they finish in the background.
pub async fn fan_in<T, F>(futures: Vec<F>) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let slots: Arc<Mutex<Vec<Option<T>>>> =
        Arc::new(Mutex::new((0..futures.len()).map(|_| None).collect()));
    let (signal, ready) = ReadySignal::new(futures.len());

    for (position, future) in futures.into_iter().enumerate() {
        let signal = signal.clone();
        let slots = slots.clone();
        tokio::spawn(async move {
            let result = future.await.map(|value| {
                slots.lock()[position] = Some(value);
            });
            signal.complete(result);
        });
    }
    drop(signal);

    ready.wait().await?;
    let values = std::mem::take(&mut *slots.lock());
    values
        .into_iter()
        .map(|value| value.ok_or(Error::Disconnected("fan-in branch")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_zero_count_fires_immediately() {
        let (signal, wait) = ReadySignal::new(0);
        assert!(signal.is_fired());
        wait.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_fires_after_all_signals() {
        let (signal, wait) = ReadySignal::new(3);
        signal.signal();
        signal.signal();
        assert_eq!(signal.remaining(), 1);
        assert!(!signal.is_fired());
        signal.signal();
        assert!(signal.is_fired());
        wait.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let (signal, wait) = ReadySignal::new(3);
        signal.signal();
        signal.complete(Err(Error::Rpc("first".into())));
        signal.complete(Err(Error::Rpc("second".into())));
        signal.signal();

        match wait.wait().await {
            Err(Error::Rpc(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extra_signals_are_ignored() {
        let (signal, wait) = ReadySignal::new(1);
        signal.signal();
        signal.signal();
        signal.complete(Err(Error::Closed));
        wait.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_signal_reports_disconnect() {
        let (signal, wait) = ReadySignal::new(2);
        signal.signal();
        drop(signal);
        assert!(matches!(wait.wait().await, Err(Error::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_fan_in_preserves_order() {
        let futures: Vec<_> = (0..4u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(20 - i * 5)).await;
                Ok(i)
            })
            .collect();
        assert_eq!(fan_in(futures).await.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fan_in_does_not_cancel_siblings() {
        let finished = Arc::new(Mutex::new(false));
        let slow = {
            let finished = finished.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                *finished.lock() = true;
                Ok(())
            }) as std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>>
        };
        let failing = Box::pin(async { Err(Error::Rpc("boom".into())) })
            as std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>>;

        assert!(fan_in(vec![slow, failing]).await.is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(*finished.lock());
    }

    #[tokio::test]
    async fn test_fan_in_empty() {
        let futures: Vec<std::future::Ready<Result<u8>>> = Vec::new();
        assert!(fan_in(futures).await.unwrap().is_empty());
    }
}
