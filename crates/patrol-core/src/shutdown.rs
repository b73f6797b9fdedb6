use tokio::sync::watch;

/// Fires the shutdown signal. Dropping it counts as firing.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable listener handed to every long-running task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.tx.subscribe() }
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Cancel safe.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn listeners_see_the_signal() {
        let (trigger, mut a) = shutdown_channel();
        let mut b = trigger.subscribe();
        assert!(!a.is_triggered());

        let waiter = tokio::spawn(async move { b.wait().await });
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        a.wait().await;
        assert!(a.is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_releases_waiters() {
        let (trigger, mut s) = shutdown_channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), s.wait()).await.unwrap();
    }
}
