/*!
 * Process-wide debug port allocation. Each process-kind worker may be
 * started with `--inspect=<port>`-style debugging enabled (the worker
 * binary decides what to do with the port; the pool's job is only to hand
 * out ports that don't collide across every pool in this process).
 */
use std::collections::HashSet;
use std::sync::Mutex;

struct Allocator {
    leased: HashSet<u16>,
}

static ALLOCATOR: Mutex<Option<Allocator>> = Mutex::new(None);

/// A leased debug port. Returned to the pool on drop.
pub struct DebugPortLease(u16);

impl DebugPortLease {
    pub fn port(&self) -> u16 {
        self.0
    }
}

impl Drop for DebugPortLease {
    fn drop(&mut self) {
        if let Ok(mut guard) = ALLOCATOR.lock() {
            if let Some(alloc) = guard.as_mut() {
                alloc.leased.remove(&self.0);
            }
        }
    }
}

/// Leases the next free port starting at `start`, skipping any port
/// currently leased by another worker in this process.
pub fn lease(start: u16) -> DebugPortLease {
    let mut guard = ALLOCATOR.lock().expect("debug port allocator poisoned");
    let alloc = guard.get_or_insert_with(|| Allocator {
        leased: HashSet::new(),
    });

    let mut candidate = start;
    while alloc.leased.contains(&candidate) {
        candidate = candidate.wrapping_add(1);
    }
    alloc.leased.insert(candidate);
    DebugPortLease(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_do_not_collide() {
        let a = lease(50000);
        let b = lease(50000);
        assert_ne!(a.port(), b.port());
    }

    #[test]
    fn dropped_lease_is_reusable() {
        let first_port = {
            let a = lease(60000);
            a.port()
        };
        let b = lease(first_port);
        assert_eq!(b.port(), first_port);
    }
}
