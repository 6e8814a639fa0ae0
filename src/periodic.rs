//! Periodic background worker used for the cleaning job.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

/// Runs a closure on its own thread every `period` until dropped.
///
/// Dropping sends the stop signal and joins, so shutdown waits for at most
/// one in-flight run of the closure.
pub(crate) struct Periodic {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub(crate) fn spawn<F>(name: &str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(1);
        let ticker = tick(period);
        let handle = Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => job(),
                    recv(stopped) -> _ => break,
                }
            })
            .expect("failed to spawn periodic worker thread");
        Periodic {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
