use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender, bounded};

/// Cloneable cancellation handle shared by the orchestrator, the deadline
/// watcher and every worker.
///
/// Cancelling drops the only sender, so every sleeping `recv_timeout` wakes at
/// once with `Disconnected`. A token made with `child` also observes the
/// cancellation of its ancestors, never the other way round.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
    parents: Vec<(Arc<AtomicBool>, Receiver<()>)>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
            parents: Vec::new(),
        }
    }

    /// New token cancelled together with `self`, whose own `cancel` leaves
    /// `self` untouched.
    pub fn child(&self) -> Self {
        let mut child = Self::new();
        child.parents = self.parents.clone();
        child.parents.push((self.flag.clone(), self.rx.clone()));
        child
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let mut guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        guard.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parents.iter().any(|(flag, _)| flag.load(Ordering::SeqCst))
    }

    /// Sleep for `d` unless cancelled first. Returns `false` when the wait
    /// was cut short (or the token was already cancelled).
    pub fn sleep(&self, d: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut sel = Select::new();
        sel.recv(&self.rx);
        for (_, rx) in &self.parents {
            sel.recv(rx);
        }
        match sel.select_timeout(d) {
            Err(_) => !self.is_cancelled(),
            Ok(op) => {
                let rx = match op.index() {
                    0 => &self.rx,
                    i => &self.parents[i - 1].1,
                };
                let _ = op.recv(rx);
                false
            }
        }
    }
}
