//! Online/offline signal and transition stream.

use tokio::sync::watch;

/// Owner side of the connectivity signal, driven by the platform layer.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with an initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Records the latest platform reading. Repeated readings of the same
    /// state do not produce a transition.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            tracing::info!(online, "connectivity changed");
            *current = online;
            true
        });
    }

    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Observer handle for consumers.
    pub fn observer(&self) -> Connectivity {
        Connectivity {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer side of the connectivity signal.
#[derive(Debug, Clone)]
pub struct Connectivity {
    rx: watch::Receiver<bool>,
}

impl Connectivity {
    /// Current state.
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the next transition and returns the new state. Returns
    /// `None` once the monitor is dropped.
    pub async fn transition(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
