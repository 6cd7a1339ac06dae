use std::future::Future;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

/// Handed to every long-running task. A task checks it between work items and selects on
///  [StopSignal::stopped] while idle, finishing the item at hand before returning.
#[derive(Clone, Debug)]
pub struct StopSignal {
    receiver: watch::Receiver<bool>,
}
impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// resolves once a stop was requested (or the owning [Stoppable] was dropped)
    pub async fn stopped(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

/// A named group of spawned tasks sharing one stop signal. Returning from a task's future is
///  its acknowledgement of the stop request.
pub struct Stoppable {
    name: String,
    sender: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}
impl Stoppable {
    pub fn new(name: impl Into<String>) -> Stoppable {
        let (sender, _) = watch::channel(false);
        Stoppable {
            name: name.into(),
            sender,
            handles: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn spawn<F>(&mut self, task_name: impl Into<String>, task: F)
    where F: Future<Output = ()> + Send + 'static
    {
        let task_name = task_name.into();
        debug!("{}: starting task {}", self.name, task_name);
        self.handles.push((task_name, tokio::spawn(task)));
    }

    /// true while no stop was requested and at least one task is still running
    pub fn is_running(&self) -> bool {
        !*self.sender.borrow() && self.handles.iter().any(|(_, h)| !h.is_finished())
    }

    /// Requests all tasks to stop and waits up to `timeout` for each of them to acknowledge.
    ///  Tasks that miss the deadline are aborted, and the returned error names them: a task
    ///  that does not react to its stop signal is a leak the caller should treat as fatal.
    pub async fn stop(self, timeout: Duration) -> anyhow::Result<()> {
        info!("{}: stopping {} tasks", self.name, self.handles.len());
        self.sender.send_replace(true);

        let deadline = time::Instant::now() + timeout;
        let mut leaked = Vec::new();
        for (task_name, handle) in self.handles {
            let abort_handle = handle.abort_handle();
            match time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!("{}: task {} stopped", self.name, task_name),
                Ok(Err(e)) => error!("{}: task {} terminated abnormally: {}", self.name, task_name, e),
                Err(_) => {
                    abort_handle.abort();
                    leaked.push(task_name);
                }
            }
        }

        if !leaked.is_empty() {
            error!("{}: tasks {:?} did not acknowledge stopping within {:?}", self.name, leaked, timeout);
            bail!("{}: tasks {:?} did not acknowledge stopping within {:?}", self.name, leaked, timeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stop_cooperative() {
        let mut stoppable = Stoppable::new("test");
        let signal = stoppable.signal();
        let finished_item = Arc::new(AtomicBool::new(false));
        let finished_item_2 = finished_item.clone();

        stoppable.spawn("worker", async move {
            signal.stopped().await;
            // simulates draining the current item after the stop request
            time::sleep(Duration::from_millis(50)).await;
            finished_item_2.store(true, Ordering::SeqCst);
        });

        assert!(stoppable.is_running());
        stoppable.stop(Duration::from_secs(1)).await.unwrap();
        assert!(finished_item.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_leak() {
        let mut stoppable = Stoppable::new("test");
        stoppable.spawn("stubborn", async {
            loop {
                time::sleep(Duration::from_secs(1)).await;
            }
        });

        let result = stoppable.stop(Duration::from_secs(2)).await;
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("stubborn"), "{}", msg);
    }

    #[tokio::test]
    async fn test_signal_is_stopped() {
        let stoppable = Stoppable::new("test");
        let signal = stoppable.signal();
        assert!(!signal.is_stopped());
        stoppable.stop(Duration::from_secs(1)).await.unwrap();
        assert!(signal.is_stopped());
    }
}
