//! Admission Controller (§4.3): decides whether this worker may arm its
//! listeners for readability on the current iteration.
//!
//! Grounded on the teacher's per-worker `max_connections` check in
//! `runtime/mio/event_loop.rs::accept_connections` (`if connections.len() >=
//! max_connections { warn!(...); continue; }`), generalized from "stop
//! accepting" to "stop listening" and extended with the spec's `lock`/
//! `unlock` predicate pair, which is the hook multi-process deployments use
//! to serialize the accept right across workers (e.g. a file lock bridging
//! processes, where the teacher's single-process cap is just `true`).

use crate::config::AdmissionHooks;

/// Whether the listeners should be armed this iteration, given the current
/// client count, the configured cap, and the admission predicate.
pub fn should_listen(hooks: &mut AdmissionHooks, clients: usize, max_clients: usize, is_empty: bool) -> bool {
    if clients >= max_clients {
        return false;
    }
    (hooks.lock)(is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_at_cap() {
        let mut hooks = AdmissionHooks::default();
        assert!(!should_listen(&mut hooks, 2, 2, true));
    }

    #[test]
    fn admits_under_cap_with_default_hooks() {
        let mut hooks = AdmissionHooks::default();
        assert!(should_listen(&mut hooks, 1, 2, true));
    }

    #[test]
    fn honors_a_denying_lock_predicate() {
        let mut hooks = AdmissionHooks {
            lock: Box::new(|_is_empty| false),
            unlock: Box::new(|| {}),
        };
        assert!(!should_listen(&mut hooks, 0, 10, true));
    }
}
