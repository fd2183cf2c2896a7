// =============================================================================
// Request Counters — per-cycle ok/fail accounting across fan-out tasks
// =============================================================================
//
// Every symbol task runs concurrently under the collector's semaphore, so the
// cycle's request bookkeeping is kept in atomic counters that any task may
// bump lock-free. A request that returned data counts ok; a transport or
// parse failure counts fail; a legitimate empty result (404) counts neither.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

/// Thread-safe per-cycle request counters.
#[derive(Default)]
pub struct RequestCounters {
    ok: AtomicU32,
    fail: AtomicU32,
}

/// Immutable snapshot of the counters, taken at cycle end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub ok: u32,
    pub fail: u32,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail(&self) {
        self.fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            ok: self.ok.load(Ordering::Relaxed),
            fail: self.fail.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RequestCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RequestCounters")
            .field("ok", &snap.ok)
            .field("fail", &snap.fail)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let c = RequestCounters::new();
        c.record_ok();
        c.record_ok();
        c.record_fail();
        let snap = c.snapshot();
        assert_eq!(snap.ok, 2);
        assert_eq!(snap.fail, 1);
    }
}
