//! "Trading ready" signal.

use parking_lot::Mutex;
use tokio::sync::watch;

/// Conditions that must hold together before trading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessFlags {
    pub authorized: bool,
    pub symbols_loaded: bool,
    pub subscriptions_active: bool,
    pub transport_open: bool,
}

impl ReadinessFlags {
    pub fn is_ready(&self) -> bool {
        self.authorized && self.symbols_loaded && self.subscriptions_active && self.transport_open
    }
}

/// Readiness of one session, recomputed from all four flags on every change.
pub struct TradingReadiness {
    flags: Mutex<ReadinessFlags>,
    ready_tx: watch::Sender<bool>,
}

impl Default for TradingReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingReadiness {
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            flags: Mutex::new(ReadinessFlags::default()),
            ready_tx,
        }
    }

    pub fn flags(&self) -> ReadinessFlags {
        *self.flags.lock()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn set_authorized(&self, value: bool) {
        self.update(|f| f.authorized = value);
    }

    pub fn set_symbols_loaded(&self, value: bool) {
        self.update(|f| f.symbols_loaded = value);
    }

    pub fn set_subscriptions_active(&self, value: bool) {
        self.update(|f| f.subscriptions_active = value);
    }

    pub fn set_transport_open(&self, value: bool) {
        self.update(|f| f.transport_open = value);
    }

    fn update(&self, change: impl FnOnce(&mut ReadinessFlags)) {
        let ready = {
            let mut flags = self.flags.lock();
            change(&mut flags);
            flags.is_ready()
        };
        self.ready_tx.send_if_modified(|current| {
            let modified = *current != ready;
            *current = ready;
            modified
        });
    }
}
