//! Named per-peer timers.
//!
//! A timer is armed under a key with [`enforce`] and cancelled with
//! [`clear`]. Re-arming a key replaces the previous timer. All timers of a
//! peer are aborted when its connection is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_types::{MeshError, Result};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::peer::Peer;

static NEXT_TIMER: AtomicU64 = AtomicU64::new(1);

/// One armed timer, tagged so an expiring task can tell whether it still
/// owns its key.
pub(crate) struct Timer {
    serial: u64,
    handle: AbortHandle,
}

/// Run `on_expiry` if `key` is not cleared within `duration`.
///
/// Must be called from within a tokio runtime.
pub fn enforce<F>(peer: &Arc<Peer>, key: &'static str, duration: Duration, on_expiry: F)
where
    F: FnOnce(Arc<Peer>) + Send + 'static,
{
    let serial = NEXT_TIMER.fetch_add(1, Ordering::Relaxed);
    let weak = Arc::downgrade(peer);

    // Held across spawn and insert so the task cannot look up its key first.
    let mut timeouts = peer.timeouts.lock();

    let task = tokio::spawn(async move {
        tokio::time::sleep(duration).await;

        let Some(peer) = weak.upgrade() else { return };

        {
            let mut timeouts = peer.timeouts.lock();
            // Cleared or re-armed after the sleep finished.
            if !timeouts.get(key).is_some_and(|timer| timer.serial == serial) {
                return;
            }
            timeouts.remove(key);
        }

        warn!("Timeout {} expired for {} after {:?}", key, peer.id(), duration);
        on_expiry(peer);
    });

    let previous = timeouts.insert(
        key,
        Timer {
            serial,
            handle: task.abort_handle(),
        },
    );
    drop(timeouts);

    if let Some(previous) = previous {
        debug!("Re-armed timeout {} for {}", key, peer.id());
        previous.handle.abort();
    }
}

/// Cancel the timer armed under `key`.
pub fn clear(peer: &Peer, key: &'static str) -> Result<()> {
    match peer.timeouts.lock().remove(key) {
        Some(timer) => {
            timer.handle.abort();
            Ok(())
        }
        None => Err(MeshError::TimeoutNotArmed {
            peer_id: peer.id(),
            key: key.to_string(),
        }),
    }
}

pub fn is_armed(peer: &Peer, key: &'static str) -> bool {
    peer.timeouts.lock().contains_key(key)
}

pub(crate) fn clear_all(peer: &Peer) {
    for (_, timer) in peer.timeouts.lock().drain() {
        timer.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::PeerId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    fn test_peer() -> Arc<Peer> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Peer::new(PeerId(7), "127.0.0.1:1".parse().unwrap(), tx))
    }

    #[tokio::test]
    async fn test_expiry_fires() {
        let peer = test_peer();

        enforce(&peer, "idle", Duration::from_millis(20), |peer| peer.disconnect());
        assert!(is_armed(&peer, "idle"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(peer.is_closed());
        assert!(!is_armed(&peer, "idle"));
    }

    #[tokio::test]
    async fn test_clear_prevents_expiry() {
        let peer = test_peer();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        enforce(&peer, "idle", Duration::from_millis(20), move |_| {
            flag.store(true, Ordering::SeqCst)
        });
        clear(&peer, "idle").unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rearm_replaces_previous_timer() {
        let peer = test_peer();
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&first);
        enforce(&peer, "idle", Duration::from_millis(20), move |_| {
            flag.store(true, Ordering::SeqCst)
        });
        let flag = Arc::clone(&second);
        enforce(&peer, "idle", Duration::from_millis(60), move |_| {
            flag.store(true, Ordering::SeqCst)
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!first.load(Ordering::SeqCst));
        assert!(is_armed(&peer, "idle"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
        assert!(!is_armed(&peer, "idle"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clear_after_sleep_elapsed_suppresses_expiry() {
        let peer = test_peer();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        enforce(&peer, "idle", Duration::from_millis(10), move |_| {
            flag.store(true, Ordering::SeqCst)
        });

        {
            // Hold the table while the sleep elapses so the timer task is
            // already running when the key is cleared.
            let mut timeouts = peer.timeouts.lock();
            std::thread::sleep(Duration::from_millis(50));
            if let Some(timer) = timeouts.remove("idle") {
                timer.handle.abort();
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn test_clear_unknown_key_errors() {
        let peer = test_peer();
        assert!(matches!(
            clear(&peer, "missing"),
            Err(MeshError::TimeoutNotArmed { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_all_aborts_everything() {
        let peer = test_peer();
        let fired = Arc::new(AtomicBool::new(false));

        for key in ["a", "b"] {
            let flag = Arc::clone(&fired);
            enforce(&peer, key, Duration::from_millis(20), move |_| {
                flag.store(true, Ordering::SeqCst)
            });
        }
        clear_all(&peer);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!is_armed(&peer, "a"));
    }
}
