use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cnode::CnodeCache;

/// One pass: drop directory hints older than `hint_ttl`, then evict cnodes
/// nobody references. Returns `(hints pruned, cnodes evicted)`.
pub fn reap_once(cache: &CnodeCache, hint_ttl: Duration) -> (usize, usize) {
    let mut pruned = 0;
    cache.for_each(|cp| {
        if cp.is_dir() {
            pruned += cp.with_hints(|h| h.prune_stale(hint_ttl));
        }
    });
    let evicted = cache.evict_unused();
    (pruned, evicted)
}

/// Start a background thread that periodically reaps the cnode cache.
pub fn start_reaper_thread(
    cache: CnodeCache,
    interval: Duration,
    hint_ttl: Duration,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("hfscat-reaper".to_string())
        .spawn(move || {
            debug!("Reaper thread started, interval={:?}", interval);
            while !shutdown.load(Ordering::Relaxed) {
                // Sleep in 1-second ticks so we notice the shutdown flag promptly.
                let mut remaining = interval;
                let tick = Duration::from_secs(1);
                while remaining > Duration::ZERO {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let sleep_time = remaining.min(tick);
                    std::thread::sleep(sleep_time);
                    remaining = remaining.saturating_sub(sleep_time);
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let (pruned, evicted) = reap_once(&cache, hint_ttl);
                if pruned > 0 || evicted > 0 {
                    debug!("reaped {} directory hints, {} cnodes", pruned, evicted);
                }
            }
            debug!("Reaper thread shutting down");
        })
}
