use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::{signal::unix::SignalKind, sync::oneshot};

type ShutdownSync = Arc<Mutex<Shutdown>>;

/// Shutdown event handler shared by the CSI plugin servers.
/// Every waiter is notified once, with the signal which triggered the shutdown.
pub struct Shutdown {
    listeners: Vec<oneshot::Sender<SignalKind>>,
    received: Option<SignalKind>,
}

impl Shutdown {
    /// Get a sync wrapper of `Self` and schedule the task which waits for the event.
    fn new_sync(event: impl ShutdownEvent + 'static) -> ShutdownSync {
        let this = Arc::new(Mutex::new(Self {
            listeners: Vec::new(),
            received: None,
        }));
        let this_clone = this.clone();
        tokio::spawn(async move { Self::run(this_clone, event).await });
        this
    }
    /// A receiver for the shutdown signal, or the signal itself if it was already received.
    fn listen(&mut self) -> Result<oneshot::Receiver<SignalKind>, SignalKind> {
        match self.received {
            Some(kind) => Err(kind),
            None => {
                let (send, receive) = oneshot::channel();
                self.listeners.push(send);
                Ok(receive)
            }
        }
    }
    async fn run(this: ShutdownSync, event: impl ShutdownEvent) {
        let Some(kind) = event.wait().await else {
            return;
        };
        let listeners = {
            let mut this = this.lock();
            this.received = Some(kind);
            std::mem::take(&mut this.listeners)
        };
        for sender in listeners {
            // the waiter may have given up already
            sender.send(kind).ok();
        }
    }
    fn waiter(this: &ShutdownSync) -> impl Future<Output = Option<SignalKind>> {
        let chan = this.lock().listen();
        async move {
            match chan {
                Ok(wait) => wait.await.ok(),
                Err(signal) => Some(signal),
            }
        }
    }
    /// Returns a future that completes when SIGINT or SIGTERM has been received.
    /// None is returned if the signal handlers could not be installed.
    pub fn wait_sig() -> impl Future<Output = Option<SignalKind>> {
        lazy_static! {
            static ref TERM: ShutdownSync = Shutdown::new_sync(IntTermEvent {});
        }
        Self::waiter(&TERM)
    }
    /// Helper async fn over `Self::wait_sig` with no return.
    pub async fn wait() {
        let _ = Self::wait_sig().await;
    }
}

#[async_trait::async_trait]
trait ShutdownEvent: Send + Sync {
    async fn wait(&self) -> Option<SignalKind>;
}

/// Shutdown Event when INT | TERM are received.
struct IntTermEvent {}
#[async_trait::async_trait]
impl ShutdownEvent for IntTermEvent {
    async fn wait(&self) -> Option<SignalKind> {
        let signals = tokio::signal::unix::signal(SignalKind::interrupt()).and_then(|int| {
            tokio::signal::unix::signal(SignalKind::terminate()).map(|term| (int, term))
        });
        let (mut sig_int, mut sig_term) = match signals {
            Ok(signals) => signals,
            Err(error) => {
                tracing::error!(%error, "Failed to register the shutdown signal handlers");
                return None;
            }
        };

        let kind = tokio::select! {
            _ = sig_int.recv() => SignalKind::interrupt(),
            _ = sig_term.recv() => SignalKind::terminate(),
        };
        tracing::warn!(signal = ?kind, "Signalled, shutting down");
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::{Shutdown, ShutdownEvent, ShutdownSync};
    use lazy_static::lazy_static;
    use tokio::signal::unix::SignalKind;

    struct AlarmEvent {}
    #[async_trait::async_trait]
    impl ShutdownEvent for AlarmEvent {
        async fn wait(&self) -> Option<SignalKind> {
            Some(SignalKind::alarm())
        }
    }

    #[tokio::test]
    async fn every_waiter_sees_the_signal() {
        lazy_static! {
            static ref ALARM: ShutdownSync = Shutdown::new_sync(AlarmEvent {});
        }
        let first = Shutdown::waiter(&ALARM).await;
        let late = Shutdown::waiter(&ALARM).await;
        assert_eq!(format!("{first:?}"), format!("{:?}", Some(SignalKind::alarm())));
        assert_eq!(format!("{late:?}"), format!("{first:?}"));
    }
}
