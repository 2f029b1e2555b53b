//! Rate-limited async IP→hostname cache with negative caching (spec.md §4.3).
//!
//! `Get` never blocks the caller and never errors: a miss enqueues the IP
//! for background resolution (deduped) and returns `None` immediately. The
//! background worker is throttled so a burst of misses can't turn into a
//! DNS retry storm.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A pluggable, possibly-fallible name lookup. Production code wires this to
/// `tokio::net::lookup_host`/`getnameinfo`; tests substitute a fixed map.
pub type ResolveFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
enum CacheEntry {
    Resolved(String),
    Negative(Instant),
}

struct Shared {
    cache: Mutex<std::collections::HashMap<String, CacheEntry>>,
    pending: Mutex<HashSet<String>>,
}

/// A background-draining reverse-DNS cache.
pub struct ReverseResolver {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<String>,
    worker: tokio::task::JoinHandle<()>,
    negative_ttl: Duration,
}

impl ReverseResolver {
    /// Spawn the background worker. `throttle` bounds resolver-function
    /// calls to at most one per interval; `negative_ttl` bounds how long a
    /// failed lookup is remembered before being retried.
    pub fn spawn(resolve: ResolveFn, throttle: Duration, negative_ttl: Duration) -> Self {
        let shared = Arc::new(Shared {
            cache: Mutex::new(std::collections::HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        });
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let worker_shared = shared.clone();
        let worker = tokio::spawn(Self::run(worker_shared, queue_rx, resolve, throttle));

        Self {
            shared,
            queue_tx,
            worker,
            negative_ttl,
        }
    }

    /// Non-blocking lookup. Returns `Some(name)` on a cache hit, `None`
    /// otherwise (and enqueues `ip` for resolution if not already pending or
    /// negatively cached).
    pub fn get(&self, ip: &str) -> Option<String> {
        {
            let mut cache = self.shared.cache.lock();
            match cache.get(ip) {
                Some(CacheEntry::Resolved(name)) => return Some(name.clone()),
                Some(CacheEntry::Negative(at)) => {
                    if at.elapsed() < self.negative_ttl {
                        return None;
                    }
                    cache.remove(ip);
                }
                None => {}
            }
        }

        let mut pending = self.shared.pending.lock();
        if pending.insert(ip.to_string()) {
            let _ = self.queue_tx.send(ip.to_string());
        }
        None
    }

    /// Cancel the background worker. Idempotent; in-flight resolution is
    /// abandoned rather than awaited.
    pub fn stop(&self) {
        self.worker.abort();
    }

    async fn run(
        shared: Arc<Shared>,
        mut queue_rx: mpsc::UnboundedReceiver<String>,
        resolve: ResolveFn,
        throttle: Duration,
    ) {
        let mut ticker = tokio::time::interval(throttle);
        let mut backlog: VecDeque<String> = VecDeque::new();

        loop {
            tokio::select! {
                maybe_ip = queue_rx.recv() => {
                    match maybe_ip {
                        Some(ip) => backlog.push_back(ip),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let Some(ip) = backlog.pop_front() else { continue };
                    shared.pending.lock().remove(&ip);

                    match resolve(ip.clone()).await {
                        Some(name) => {
                            debug!(ip = %ip, name = %name, "resolved");
                            shared.cache.lock().insert(ip, CacheEntry::Resolved(name));
                        }
                        None => {
                            warn!(ip = %ip, "reverse resolve failed, negatively caching");
                            shared.cache.lock().insert(ip, CacheEntry::Negative(Instant::now()));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn mock_resolver(map: HashMap<&'static str, &'static str>) -> ResolveFn {
        let map: HashMap<String, String> = map
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(move |ip: String| {
            let map = map.clone();
            Box::pin(async move { map.get(&ip).cloned() })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn miss_then_eventual_hit() {
        let resolver = ReverseResolver::spawn(
            mock_resolver(HashMap::from([
                ("1.2.3.4", "test.domain.name"),
                ("4.3.2.1", "im.a.little.tea.pot"),
            ])),
            Duration::from_millis(1),
            Duration::from_secs(30),
        );

        assert_eq!(resolver.get("1.2.3.4"), None);

        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(1)).await;
            if resolver.get("1.2.3.4").is_some() {
                break;
            }
        }
        assert_eq!(resolver.get("1.2.3.4").as_deref(), Some("test.domain.name"));
        resolver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_ip_is_negatively_cached() {
        let resolver = ReverseResolver::spawn(
            mock_resolver(HashMap::new()),
            Duration::from_millis(1),
            Duration::from_secs(30),
        );

        assert_eq!(resolver.get("9.9.9.9"), None);
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(resolver.get("9.9.9.9"), None);
        resolver.stop();
    }
}
