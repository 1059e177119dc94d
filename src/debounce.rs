//! Per-pair trigger gate for subscription-driven reconciliation.
//!
//! Each key has an explicit `primed` flag: the first signal after subscribing is the
//! subscription's initial snapshot and is discarded. Later signals use a leading debounce:
//! the first one fires, and any signal that arrives while a pass for the key is in flight
//! or within the quiet interval of the previous signal is coalesced into it. Every
//! coalesced signal restarts the quiet interval.
//!
//! A signal that lands after the fired pass has started reading the chain may describe a
//! change that pass missed. It marks the key dirty and [`TriggerGate::complete`] then asks
//! for exactly one follow-up pass, so passes for one key never overlap.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::AssetId;

/// Debounce key. `target == None` is the account membership key of `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub base: AssetId,
    pub target: Option<AssetId>,
}

impl PairKey {
    pub fn pair(base: AssetId, target: AssetId) -> Self {
        Self {
            base,
            target: Some(target),
        }
    }

    pub fn membership(base: AssetId) -> Self {
        Self { base, target: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Initial snapshot of a fresh subscription.
    Discarded,
    /// Folded into a pass that already fired.
    Coalesced,
    /// Start a reconciliation pass: call [`TriggerGate::begin`] before reading the chain
    /// and [`TriggerGate::complete`] afterwards.
    Fire,
}

#[derive(Debug, Default)]
struct Slot {
    primed: bool,
    last_signal: Option<Instant>,
    in_flight: bool,
    running: bool,
    dirty: bool,
}

#[derive(Debug)]
pub struct TriggerGate {
    quiet: Duration,
    slots: Mutex<HashMap<PairKey, Slot>>,
}

impl TriggerGate {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PairKey, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn signal(&self, key: PairKey) -> TriggerDecision {
        let now = Instant::now();
        let mut slots = self.slots();
        let slot = slots.entry(key).or_default();

        if !slot.primed {
            slot.primed = true;
            return TriggerDecision::Discarded;
        }

        let within_window = slot
            .last_signal
            .map_or(false, |last| now.saturating_duration_since(last) < self.quiet);
        slot.last_signal = Some(now);

        if slot.in_flight {
            slot.dirty |= slot.running;
            return TriggerDecision::Coalesced;
        }
        if within_window {
            return TriggerDecision::Coalesced;
        }
        slot.in_flight = true;
        TriggerDecision::Fire
    }

    /// The fired pass for `key` is about to read the chain.
    pub fn begin(&self, key: PairKey) {
        if let Some(slot) = self.slots().get_mut(&key) {
            slot.running = true;
        }
    }

    /// Marks the pass fired for `key` as finished. Returns `true` when a signal arrived
    /// while it was running; the key then stays in flight and the caller runs one more
    /// pass, starting again with [`TriggerGate::begin`].
    pub fn complete(&self, key: PairKey) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&key) else {
            return false;
        };
        slot.running = false;
        if slot.dirty {
            slot.dirty = false;
            return true;
        }
        slot.in_flight = false;
        false
    }

    pub fn is_primed(&self, key: &PairKey) -> bool {
        self.slots().get(key).map_or(false, |s| s.primed)
    }

    /// Forgets every key of `base`; its next signal is treated as an initial snapshot.
    pub fn remove_base(&self, base: &AssetId) {
        self.slots().retain(|key, _| key.base != *base);
    }

    /// Forgets one key.
    pub fn remove(&self, key: &PairKey) {
        self.slots().remove(key);
    }
}
