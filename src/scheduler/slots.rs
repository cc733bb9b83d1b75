//! Slot accounting: named abstract resources with concurrency caps and
//! exclusion rules.
//!
//! `gpu` and `browser_headful` each admit one holder and exclude each
//! other. `network_client` admits a configured number of holders with at
//! most one per domain. `cpu_nlp` is unbounded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::store::types::Slot;

#[derive(Debug, Default)]
struct SlotState {
    gpu: usize,
    browser: usize,
    network: usize,
    per_domain: HashMap<String, usize>,
}

/// Shared slot table; workers acquire before running a job and the guard
/// releases on drop.
pub struct SlotTable {
    state: Mutex<SlotState>,
    network_cap: usize,
}

impl SlotTable {
    pub fn new(network_cap: usize) -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            network_cap: network_cap.max(1),
        }
    }

    /// Try to acquire a slot. Returns a guard on success; the job cannot
    /// run right now otherwise.
    pub fn try_acquire(
        self: &Arc<Self>,
        slot: Slot,
        domain: Option<&str>,
    ) -> Option<SlotGuard> {
        let mut state = self.state.lock().expect("slot table mutex");
        let granted = match slot {
            Slot::Gpu => {
                if state.gpu == 0 && state.browser == 0 {
                    state.gpu = 1;
                    true
                } else {
                    false
                }
            }
            Slot::BrowserHeadful => {
                if state.browser == 0 && state.gpu == 0 {
                    state.browser = 1;
                    true
                } else {
                    false
                }
            }
            Slot::NetworkClient => {
                let domain_busy = domain
                    .map(|d| state.per_domain.get(d).copied().unwrap_or(0) > 0)
                    .unwrap_or(false);
                if state.network < self.network_cap && !domain_busy {
                    state.network += 1;
                    if let Some(d) = domain {
                        *state.per_domain.entry(d.to_string()).or_insert(0) += 1;
                    }
                    true
                } else {
                    false
                }
            }
            Slot::CpuNlp => true,
        };
        drop(state);

        if granted {
            Some(SlotGuard {
                table: Arc::clone(self),
                slot,
                domain: domain.map(str::to_string),
            })
        } else {
            None
        }
    }

    fn release(&self, slot: Slot, domain: Option<&str>) {
        let mut state = self.state.lock().expect("slot table mutex");
        match slot {
            Slot::Gpu => state.gpu = state.gpu.saturating_sub(1),
            Slot::BrowserHeadful => state.browser = state.browser.saturating_sub(1),
            Slot::NetworkClient => {
                state.network = state.network.saturating_sub(1);
                if let Some(d) = domain {
                    if let Some(count) = state.per_domain.get_mut(d) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            state.per_domain.remove(d);
                        }
                    }
                }
            }
            Slot::CpuNlp => {}
        }
    }

    /// Current holders of a slot, for status reporting.
    pub fn in_use(&self, slot: Slot) -> usize {
        let state = self.state.lock().expect("slot table mutex");
        match slot {
            Slot::Gpu => state.gpu,
            Slot::BrowserHeadful => state.browser,
            Slot::NetworkClient => state.network,
            Slot::CpuNlp => 0,
        }
    }
}

/// Holds a slot until dropped.
pub struct SlotGuard {
    table: Arc<SlotTable>,
    slot: Slot,
    domain: Option<String>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.release(self.slot, self.domain.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_and_browser_are_mutually_exclusive() {
        let table = Arc::new(SlotTable::new(4));

        let gpu = table.try_acquire(Slot::Gpu, None).unwrap();
        assert!(table.try_acquire(Slot::BrowserHeadful, None).is_none());
        assert!(table.try_acquire(Slot::Gpu, None).is_none());

        drop(gpu);
        let browser = table.try_acquire(Slot::BrowserHeadful, None).unwrap();
        assert!(table.try_acquire(Slot::Gpu, None).is_none());
        drop(browser);
        assert!(table.try_acquire(Slot::Gpu, None).is_some());
    }

    #[test]
    fn test_network_cap_and_per_domain_limit() {
        let table = Arc::new(SlotTable::new(2));

        let a = table.try_acquire(Slot::NetworkClient, Some("a.org")).unwrap();
        // Same domain: refused even though capacity remains.
        assert!(table.try_acquire(Slot::NetworkClient, Some("a.org")).is_none());

        let _b = table.try_acquire(Slot::NetworkClient, Some("b.org")).unwrap();
        // Capacity exhausted.
        assert!(table.try_acquire(Slot::NetworkClient, Some("c.org")).is_none());

        drop(a);
        assert!(table.try_acquire(Slot::NetworkClient, Some("a.org")).is_some());
    }

    #[test]
    fn test_cpu_nlp_is_unbounded() {
        let table = Arc::new(SlotTable::new(1));
        let guards: Vec<_> = (0..16)
            .map(|_| table.try_acquire(Slot::CpuNlp, None).unwrap())
            .collect();
        assert_eq!(guards.len(), 16);
        assert_eq!(table.in_use(Slot::CpuNlp), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let table = Arc::new(SlotTable::new(1));
        {
            let _guard = table.try_acquire(Slot::NetworkClient, Some("x.org")).unwrap();
            assert_eq!(table.in_use(Slot::NetworkClient), 1);
        }
        assert_eq!(table.in_use(Slot::NetworkClient), 0);
    }
}
