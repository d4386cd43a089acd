use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use drover_core::events::ObserverEvent;
use drover_core::ids::IdentityId;
use drover_core::machine::MachineId;
use drover_core::protocol::ServerMessage;

/// Routing table for live transports.
///
/// Transports are serialized-frame senders (`mpsc::Sender<String>`), so the
/// registry is independent of the socket layer and fully testable with bare
/// channels. All sends are best-effort: peers going away is a normal
/// outcome, reported as `false`, never as an error.
pub struct ConnectionRegistry {
    machines: DashMap<MachineId, mpsc::Sender<String>>,
    observers: DashMap<IdentityId, Vec<ObserverSlot>>,
    next_observer_id: AtomicU64,
}

struct ObserverSlot {
    id: u64,
    tx: mpsc::Sender<String>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            machines: DashMap::new(),
            observers: DashMap::new(),
            next_observer_id: AtomicU64::new(1),
        }
    }

    /// Register a machine transport. A newer connection for the same id
    /// supersedes any existing one.
    pub fn register_machine(&self, machine_id: &MachineId, tx: mpsc::Sender<String>) {
        if self.machines.insert(machine_id.clone(), tx).is_some() {
            info!(machine_id = %machine_id, "machine reconnected, superseding stale connection");
        } else {
            info!(machine_id = %machine_id, "machine connected");
        }
    }

    /// Remove a machine transport, but only if `tx` is still the live one.
    /// A loop whose connection was superseded must not evict its successor.
    pub fn unregister_machine(&self, machine_id: &MachineId, tx: &mpsc::Sender<String>) {
        let removed = self
            .machines
            .remove_if(machine_id, |_, current| current.same_channel(tx))
            .is_some();
        if removed {
            info!(machine_id = %machine_id, "machine disconnected");
        }
    }

    pub fn machine_connected(&self, machine_id: &MachineId) -> bool {
        self.machines.contains_key(machine_id)
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// Send a message to a machine. Returns whether it was handed to a live
    /// transport; a closed transport is evicted on the spot.
    pub fn send_to_machine(&self, machine_id: &MachineId, message: &ServerMessage) -> bool {
        let Ok(json) = serde_json::to_string(message) else {
            return false;
        };
        let Some(entry) = self.machines.get(machine_id) else {
            debug!(machine_id = %machine_id, "no live connection for machine");
            return false;
        };

        match entry.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Backpressure, not death: keep the entry, drop the frame.
                warn!(machine_id = %machine_id, "machine send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let tx = entry.value().clone();
                drop(entry);
                self.unregister_machine(machine_id, &tx);
                warn!(machine_id = %machine_id, "machine transport closed, evicted");
                false
            }
        }
    }

    /// Register an observer transport for an identity. Additive: one
    /// identity may hold several simultaneous dashboard sessions.
    pub fn register_observer(&self, identity: &IdentityId, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .entry(identity.clone())
            .or_default()
            .push(ObserverSlot { id, tx });
        info!(identity = %identity, observer = id, "observer connected");
        id
    }

    /// Remove one observer transport. Removing an absent entry is a no-op.
    pub fn unregister_observer(&self, identity: &IdentityId, observer_id: u64) {
        let mut emptied = false;
        if let Some(mut slots) = self.observers.get_mut(identity) {
            slots.retain(|s| s.id != observer_id);
            emptied = slots.is_empty();
        }
        if emptied {
            self.observers
                .remove_if(identity, |_, slots| slots.is_empty());
        }
    }

    pub fn observer_count(&self, identity: &IdentityId) -> usize {
        self.observers.get(identity).map(|s| s.len()).unwrap_or(0)
    }

    /// Best-effort fan-out to every live transport of an identity. A dead
    /// transport is evicted without aborting delivery to the rest.
    pub fn broadcast_to_observers(&self, identity: &IdentityId, event: &ObserverEvent) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        let Some(mut slots) = self.observers.get_mut(identity) else {
            debug!(identity = %identity, "no observer connections for identity");
            return;
        };

        slots.retain(|slot| match slot.tx.try_send(json.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(identity = %identity, observer = slot.id, "observer queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(identity = %identity, observer = slot.id, "evicting closed observer transport");
                false
            }
        });
    }
}
