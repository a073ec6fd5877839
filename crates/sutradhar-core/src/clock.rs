use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current wall-clock time in milliseconds, guaranteed strictly increasing
/// across the process.
///
/// When two callers land on the same millisecond the second one is bumped
/// by one, so timestamp-suffixed ids stay unique even under clock ties.
pub fn unique_millis() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let mut candidate = now;
    loop {
        let last = LAST_MILLIS.load(Ordering::SeqCst);
        if candidate <= last {
            candidate = last + 1;
        }
        if LAST_MILLIS
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return candidate;
        }
    }
}
