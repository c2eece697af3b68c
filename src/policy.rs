use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::client::DnsClient;

/// One pick per dispatch slot. Pickers are shared across the feeder and any
/// concurrent callers, so implementations must be safe under concurrent
/// `pick` calls.
pub trait Picker: Send + Sync {
    fn pick(&self) -> Arc<DnsClient>;
}

/// Capability that turns the configured client list into a per-dispatch
/// picker. The dispatcher depends only on this trait, never on a concrete
/// policy.
pub trait SelectionPolicy: Send + Sync {
    fn selector(&self, clients: &[Arc<DnsClient>]) -> Box<dyn Picker>;
}

/// Returns clients in their configured order, one full pass per dispatch
/// cycle, wrapping afterwards.
#[derive(Debug, Default)]
pub struct SequentialPolicy;

struct SequentialPicker {
    clients: Vec<Arc<DnsClient>>,
    cursor: AtomicUsize,
}

impl SelectionPolicy for SequentialPolicy {
    fn selector(&self, clients: &[Arc<DnsClient>]) -> Box<dyn Picker> {
        Box::new(SequentialPicker {
            clients: clients.to_vec(),
            cursor: AtomicUsize::new(0),
        })
    }
}

impl Picker for SequentialPicker {
    fn pick(&self) -> Arc<DnsClient> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Arc::clone(&self.clients[idx])
    }
}

/// Weighted-random order: every client is picked exactly once per cycle, the
/// order biased by per-client load factors (1..=100).
#[derive(Debug)]
pub struct WeightedPolicy {
    load_factor: Vec<u8>,
}

impl WeightedPolicy {
    pub fn new(load_factor: Vec<u8>) -> Self {
        Self { load_factor }
    }
}

struct WeightedPicker {
    // remaining (client, weight) pairs for the current pass
    remaining: Mutex<Vec<(Arc<DnsClient>, u32)>>,
    all: Vec<(Arc<DnsClient>, u32)>,
}

impl SelectionPolicy for WeightedPolicy {
    fn selector(&self, clients: &[Arc<DnsClient>]) -> Box<dyn Picker> {
        let all: Vec<(Arc<DnsClient>, u32)> = clients
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let weight = self.load_factor.get(i).copied().unwrap_or(1).max(1) as u32;
                (Arc::clone(c), weight)
            })
            .collect();
        Box::new(WeightedPicker {
            remaining: Mutex::new(all.clone()),
            all,
        })
    }
}

impl Picker for WeightedPicker {
    fn pick(&self) -> Arc<DnsClient> {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        if remaining.is_empty() {
            // new pass once the cycle is exhausted
            remaining.extend(self.all.iter().cloned());
        }
        let total: u32 = remaining.iter().map(|(_, w)| w).sum();
        let mut roll = rand::thread_rng().gen_range(0..total);
        let mut chosen = remaining.len() - 1;
        for (i, (_, weight)) in remaining.iter().enumerate() {
            if roll < *weight {
                chosen = i;
                break;
            }
            roll -= weight;
        }
        remaining.swap_remove(chosen).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Net;
    use std::collections::HashSet;

    fn clients(n: usize) -> Vec<Arc<DnsClient>> {
        (0..n)
            .map(|i| {
                Arc::new(DnsClient::new(
                    format!("127.0.0.{}:53", i + 1).parse().expect("addr"),
                    Net::Udp,
                ))
            })
            .collect()
    }

    #[test]
    fn sequential_picker_walks_configured_order() {
        let clients = clients(3);
        let picker = SequentialPolicy.selector(&clients);
        for expected in &clients {
            assert_eq!(picker.pick().endpoint(), expected.endpoint());
        }
        // wraps after one full pass
        assert_eq!(picker.pick().endpoint(), clients[0].endpoint());
    }

    #[test]
    fn sequential_picker_covers_all_clients_under_concurrent_picks() {
        let clients = clients(8);
        let picker: Arc<dyn Picker> = SequentialPolicy.selector(&clients).into();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let picker = Arc::clone(&picker);
                std::thread::spawn(move || picker.pick().endpoint())
            })
            .collect();
        let picked: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(picked.len(), 8, "one pass must not duplicate clients");
    }

    #[test]
    fn weighted_picker_yields_each_client_once_per_cycle() {
        let clients = clients(4);
        let policy = WeightedPolicy::new(vec![70, 10, 10, 10]);
        let picker = policy.selector(&clients);
        let picked: HashSet<String> = (0..4).map(|_| picker.pick().endpoint()).collect();
        assert_eq!(picked.len(), 4);
    }
}
