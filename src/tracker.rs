//! Concurrent UDP flow tracker (spec.md §4.5).
//!
//! A single mutex-guarded registry of in-flight flows, generalized from the
//! engine's own `Mutex<EngineState>` pattern (a single-slot guarded state)
//! to a multi-entry one keyed on the flow's 4-tuple fingerprint.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::envelope::UdpEnvelope;

/// Identifies a UDP flow by its local/remote address pair, from the
/// perspective of the TUN side (local = the device behind this gateway).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowFingerprint {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

impl fmt::Display for FlowFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// What the tracker hands back for an existing or newly created flow: a
/// queue the ingress handler feeds with inbound-from-TUN envelopes, and a
/// token the flow worker watches to know when it's been torn down from
/// outside (e.g. `FlowTracker::clear` racing the worker's own exit).
#[derive(Clone)]
pub struct FlowHandle {
    pub inbound: mpsc::Sender<UdpEnvelope>,
    pub cancel: CancellationToken,
}

/// Registry of live flows, shared between the ingress handler (which looks
/// flows up and creates them on first sight) and each flow worker (which
/// clears its own entry on exit).
pub struct FlowTracker {
    flows: Mutex<HashMap<FlowFingerprint, FlowHandle, ahash::RandomState>>,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::default()),
        }
    }

    /// Returns the handle for `fingerprint`, creating one via `create` if
    /// absent. `create` runs with the registry lock held, so it must only
    /// construct a handle (e.g. spawn the flow worker and hand back its
    /// channel ends) and never block or re-enter the tracker.
    pub fn get_or_create(
        &self,
        fingerprint: FlowFingerprint,
        create: impl FnOnce() -> FlowHandle,
    ) -> FlowHandle {
        self.flows
            .lock()
            .entry(fingerprint)
            .or_insert_with(create)
            .clone()
    }

    /// Looks up `fingerprint` without creating it.
    pub fn get(&self, fingerprint: &FlowFingerprint) -> Option<FlowHandle> {
        self.flows.lock().get(fingerprint).cloned()
    }

    /// Removes `fingerprint`'s entry. A no-op if it's already gone: a flow
    /// worker tearing itself down races no one else for its own entry, but
    /// a caller clearing a fingerprint it no longer owns (e.g. after a
    /// flow already replaced itself) must not panic.
    pub fn clear(&self, fingerprint: &FlowFingerprint) {
        self.flows.lock().remove(fingerprint);
    }

    /// Snapshot of every currently-tracked flow's handle, for callers that
    /// need to signal all of them at once (e.g. a proactive shutdown).
    pub fn handles(&self) -> Vec<FlowHandle> {
        self.flows.lock().values().cloned().collect()
    }

    /// Drops every tracked entry at once. A caller that fires
    /// [`FlowHandle::cancel`] on every handle (quit-by-other) must follow up
    /// with this — per spec.md §4.6, the caller that signals `quit_by_other`
    /// owns clearing the tracker, since the worker's own teardown
    /// deliberately skips it for that reason.
    pub fn clear_all(&self) {
        self.flows.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fingerprint(port: u16) -> FlowFingerprint {
        FlowFingerprint {
            local_ip: Ipv4Addr::new(10, 0, 0, 1),
            local_port: port,
            remote_ip: Ipv4Addr::new(203, 0, 113, 9),
            remote_port: 53,
        }
    }

    fn handle() -> FlowHandle {
        let (tx, _rx) = mpsc::channel(8);
        FlowHandle {
            inbound: tx,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn get_or_create_reuses_existing_entry() {
        let tracker = FlowTracker::new();
        let fp = fingerprint(1);
        let creations = Arc::new(AtomicUsize::new(0));

        let make = |creations: Arc<AtomicUsize>| {
            move || {
                creations.fetch_add(1, Ordering::SeqCst);
                handle()
            }
        };

        let _first = tracker.get_or_create(fp, make(creations.clone()));
        let _second = tracker.get_or_create(fp, make(creations.clone()));

        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn clear_is_idempotent() {
        let tracker = FlowTracker::new();
        let fp = fingerprint(2);
        tracker.get_or_create(fp, handle);
        assert_eq!(tracker.len(), 1);

        tracker.clear(&fp);
        assert!(tracker.is_empty());
        // clearing an absent fingerprint must not panic
        tracker.clear(&fp);
        assert!(tracker.is_empty());
    }

    #[test]
    fn distinct_fingerprints_get_distinct_entries() {
        let tracker = FlowTracker::new();
        tracker.get_or_create(fingerprint(1), handle);
        tracker.get_or_create(fingerprint(2), handle);
        assert_eq!(tracker.len(), 2);
    }
}
