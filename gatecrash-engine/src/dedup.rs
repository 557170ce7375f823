//! Cross-module dedup: one fingerprint set per target URL, owned by the
//! orchestrator. Modules already dedup internally; this layer stops module
//! B from re-sending a request module A already dispatched.

use gatecrash_payload::Fingerprint;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct GlobalDedup {
    seen: Mutex<HashSet<Fingerprint>>,
}

impl GlobalDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per fingerprint.
    pub fn first_seen(&self, fp: Fingerprint) -> bool {
        self.seen.lock().expect("dedup lock").insert(fp)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatecrash_payload::{BypassPayload, TargetUrl};

    #[test]
    fn suppresses_across_modules() {
        let dedup = GlobalDedup::new();
        let target = TargetUrl::parse("http://h/x").unwrap();
        // Same wire bytes from two different modules.
        let a = BypassPayload::from_target("dumb_check", &target);
        let b = BypassPayload::from_target("mid_paths", &target);

        assert!(dedup.first_seen(a.fingerprint()));
        assert!(!dedup.first_seen(b.fingerprint()));
        assert_eq!(dedup.len(), 1);
    }
}
