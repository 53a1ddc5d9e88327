//! Session keep-alive
//!
//! One task per session. Sends the configured NOP pattern, or a
//! ListServices probe once the connection is Class 3 connected. Three
//! consecutive failures trigger re-establishment with bounded exponential
//! backoff; exhausting the retries closes the session. The task holds
//! only the session id and the shared table handle; cancellation is a
//! boolean checked before each sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::session::manager::{ensure_connected, ManagerShared, SessionEntry};

/// Failures in a row before the connection is declared dead.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub(crate) fn spawn(
    shared: Arc<ManagerShared>,
    session_id: String,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(run(shared, session_id, stop))
}

async fn run(shared: Arc<ManagerShared>, session_id: String, stop: Arc<AtomicBool>) {
    let interval = shared.config.heartbeat_interval;
    let mut failures: u32 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        sleep(interval).await;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        // look the session up fresh each tick; a missing entry means the
        // session is gone and the task exits silently
        let entry = match shared.sessions.read().await.get(&session_id) {
            Some(entry) => Arc::clone(entry),
            None => break,
        };
        if entry.is_closed() {
            break;
        }

        match beat(&shared, &entry).await {
            Ok(()) => {
                failures = 0;
                entry.set_keep_alive_active(true);
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "keep-alive for session {} failed ({}/{}): {}",
                    session_id, failures, MAX_CONSECUTIVE_FAILURES, e
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    entry.set_keep_alive_active(false);
                    if reestablish(&shared, &entry).await {
                        info!("session {} re-established after keep-alive failures", session_id);
                        failures = 0;
                        entry.set_keep_alive_active(true);
                    } else {
                        warn!(
                            "session {} closed: connection could not be re-established",
                            session_id
                        );
                        entry.mark_closed();
                        break;
                    }
                }
            }
        }
    }
    debug!("keep-alive task for session {} exited", session_id);
}

/// One keep-alive probe, serialized with request dispatch.
async fn beat(shared: &ManagerShared, entry: &SessionEntry) -> Result<()> {
    let _guard = entry.dispatch.lock().await;
    if entry.is_closed() {
        return Err(Error::SessionClosed);
    }
    let mut lease = entry.pool.acquire(shared.config.acquire_timeout).await?;
    let result = if lease.state() == ConnectionState::Connected {
        lease.probe_list_services().await
    } else {
        lease.heartbeat_nop(&shared.config.keep_alive_pattern).await
    };
    if result.is_ok() {
        entry.touch();
    }
    result
}

/// Try to bring a fresh connection up, backing off between attempts.
async fn reestablish(shared: &ManagerShared, entry: &SessionEntry) -> bool {
    for attempt in 0..shared.config.reconnect_retries {
        sleep(shared.config.backoff_delay(attempt)).await;
        if entry.is_closed() {
            return false;
        }
        match reconnect(shared, entry).await {
            Ok(()) => return true,
            Err(e) => warn!(
                "re-establishment attempt {}/{} for session {} failed: {}",
                attempt + 1,
                shared.config.reconnect_retries,
                entry.id,
                e
            ),
        }
    }
    false
}

async fn reconnect(shared: &ManagerShared, entry: &SessionEntry) -> Result<()> {
    let _guard = entry.dispatch.lock().await;
    let mut lease = entry.pool.acquire(shared.config.acquire_timeout).await?;
    ensure_connected(&mut lease).await?;
    entry.record_connection(&lease);
    entry.touch();
    Ok(())
}
