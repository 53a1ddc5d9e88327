//! Session orchestrator
//!
//! Maps caller-visible session ids onto pooled connections, serializes
//! dispatch per session, runs one keep-alive task per session, and keeps
//! the shared tables: registry, sessions, pools. Lock acquisition order is
//! registry → sessions → pools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::CipStatus;
use crate::config::CoreConfig;
use crate::connection::{Connection, ConnectionOptions, ConnectionState, Endpoint};
use crate::error::{Error, Result};
use crate::pool::{Lease, Pool};
use crate::registry::{Assembly, AssemblyRegistry, DeviceIdentity};
use crate::session::heartbeat;
use crate::session::types::{
    CipExchange, CipTransport, ConnectionDiagnostics, OpenSessionResponse, SessionDiagnostics,
};

/// Shared orchestrator state; heartbeat tasks hold this plus a session id,
/// never a session struct, so a session removed from the table lets its
/// task exit.
pub(crate) struct ManagerShared {
    pub(crate) config: CoreConfig,
    pub(crate) registry: RwLock<AssemblyRegistry>,
    pub(crate) sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    pub(crate) pools: Mutex<HashMap<Endpoint, Arc<Pool>>>,
}

struct DiagState {
    last_activity: DateTime<Utc>,
    last_status: CipStatus,
    connected: bool,
    enip_session_handle: u32,
    o_t_connection_id: u32,
    t_o_connection_id: u32,
    keep_alive_active: bool,
}

/// One logical session: pool handle, FIFO dispatch lock, diagnostics.
pub(crate) struct SessionEntry {
    pub(crate) id: String,
    pub(crate) endpoint: Endpoint,
    pub(crate) pool: Arc<Pool>,
    /// Serializes request dispatch and the keep-alive; tokio's mutex wakes
    /// waiters in FIFO order, which gives submission-order execution.
    pub(crate) dispatch: Mutex<()>,
    pub(crate) heartbeat_stop: Arc<AtomicBool>,
    diag: std::sync::Mutex<DiagState>,
    closed: AtomicBool,
}

impl SessionEntry {
    fn new(id: String, endpoint: Endpoint, pool: Arc<Pool>) -> Self {
        Self {
            id,
            endpoint,
            pool,
            dispatch: Mutex::new(()),
            heartbeat_stop: Arc::new(AtomicBool::new(false)),
            diag: std::sync::Mutex::new(DiagState {
                last_activity: Utc::now(),
                last_status: CipStatus::SUCCESS,
                connected: false,
                enip_session_handle: 0,
                o_t_connection_id: 0,
                t_o_connection_id: 0,
                keep_alive_active: false,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session and signal the keep-alive task to stop.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.heartbeat_stop.store(true, Ordering::SeqCst);
        let mut diag = self.lock_diag();
        diag.connected = false;
        diag.keep_alive_active = false;
    }

    pub(crate) fn record_connection(&self, connection: &Connection) {
        let mut diag = self.lock_diag();
        diag.connected = connection.state() == ConnectionState::Connected;
        diag.enip_session_handle = connection.session_handle();
        diag.o_t_connection_id = connection.o_t_connection_id();
        diag.t_o_connection_id = connection.t_o_connection_id();
    }

    pub(crate) fn record_status(&self, status: CipStatus) {
        self.lock_diag().last_status = status;
    }

    pub(crate) fn touch(&self) {
        self.lock_diag().last_activity = Utc::now();
    }

    pub(crate) fn set_keep_alive_active(&self, active: bool) {
        self.lock_diag().keep_alive_active = active;
    }

    pub(crate) fn diagnostics(&self, pattern: &[u8]) -> SessionDiagnostics {
        let diag = self.lock_diag();
        SessionDiagnostics {
            session_id: self.id.clone(),
            connection: ConnectionDiagnostics {
                endpoint: self.endpoint.to_string(),
                connected: diag.connected,
                enip_connection_id: diag.enip_session_handle,
                o_t_connection_id: diag.o_t_connection_id,
                t_o_connection_id: diag.t_o_connection_id,
            },
            keep_alive_pattern_hex: hex::encode(pattern),
            keep_alive_active: diag.keep_alive_active,
            last_activity: diag.last_activity,
            last_status: diag.last_status.into(),
            closed: self.is_closed(),
        }
    }

    fn lock_diag(&self) -> std::sync::MutexGuard<'_, DiagState> {
        self.diag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The session orchestrator.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                config,
                registry: RwLock::new(AssemblyRegistry::empty()),
                sessions: RwLock::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    /// Open a session against the default endpoint or a caller override,
    /// verify connectivity, and start its keep-alive task.
    pub async fn open_session(
        &self,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<OpenSessionResponse> {
        let config = &self.shared.config;
        let endpoint = Endpoint::new(
            host.unwrap_or_else(|| config.host.clone()),
            port.unwrap_or(config.port),
        );
        let pool = self.pool_for(&endpoint).await;
        let session_id = new_session_id();
        let entry = Arc::new(SessionEntry::new(
            session_id.clone(),
            endpoint.clone(),
            Arc::clone(&pool),
        ));

        {
            let mut lease = pool.acquire(config.acquire_timeout).await?;
            ensure_connected(&mut lease).await?;
            entry.record_connection(&lease);
            entry.record_status(CipStatus::SUCCESS);
            entry.touch();
        }

        self.shared
            .sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&entry));
        // detached by design: the task watches the stop flag and the table
        let _ = heartbeat::spawn(
            Arc::clone(&self.shared),
            session_id.clone(),
            Arc::clone(&entry.heartbeat_stop),
        );
        entry.set_keep_alive_active(true);

        info!("opened session {} against {}", session_id, endpoint);
        Ok(OpenSessionResponse {
            session_id,
            diagnostics: entry.diagnostics(&config.keep_alive_pattern),
        })
    }

    /// Close a session: stop the keep-alive, tear down the endpoint's
    /// current connection, drop the table entry. Closing an unknown or
    /// already-closed id is a no-op.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let entry = match self.shared.sessions.write().await.remove(session_id) {
            Some(entry) => entry,
            None => {
                debug!("close of unknown session {} ignored", session_id);
                return Ok(());
            }
        };
        entry.mark_closed();
        // wait out any in-flight dispatch before tearing the connection down
        let _guard = entry.dispatch.lock().await;
        if let Some(mut lease) = entry.pool.try_acquire_idle() {
            if let Err(e) = lease.close().await {
                warn!("teardown for session {} failed: {}", session_id, e);
            }
        }
        info!("closed session {}", session_id);
        Ok(())
    }

    pub async fn diagnostics(&self, session_id: &str) -> Result<SessionDiagnostics> {
        let entry = self.entry(session_id).await?;
        Ok(entry.diagnostics(&self.shared.config.keep_alive_pattern))
    }

    pub async fn list_sessions(&self) -> Vec<SessionDiagnostics> {
        let pattern = &self.shared.config.keep_alive_pattern;
        self.shared
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.diagnostics(pattern))
            .collect()
    }

    /// Dispatch one CIP exchange on a session. Dispatch is serialized per
    /// session in submission order; the whole operation runs under the
    /// configured request deadline, and a deadline hit abandons the
    /// connection as Broken rather than leaving a reply in flight.
    pub async fn exchange(
        &self,
        session_id: &str,
        exchange: CipExchange,
    ) -> Result<(CipStatus, Vec<u8>)> {
        let config = &self.shared.config;
        let entry = self.entry(session_id).await?;
        if entry.is_closed() {
            return Err(Error::SessionClosed);
        }
        let _guard = entry.dispatch.lock().await;
        if entry.is_closed() {
            return Err(Error::SessionClosed);
        }

        let mut lease = entry.pool.acquire(config.acquire_timeout).await?;
        let CipExchange {
            service,
            path,
            data,
            transport,
        } = exchange;
        let result = timeout(config.request_timeout, async {
            match transport {
                CipTransport::Connected => {
                    ensure_connected(&mut lease).await?;
                    lease.request_unit(service, path, data).await
                }
                CipTransport::Unconnected { unconnected_send } => {
                    lease.request_rr(service, path, data, unconnected_send).await
                }
            }
        })
        .await;

        match result {
            Ok(Ok((status, data))) => {
                entry.record_connection(&lease);
                entry.record_status(status);
                entry.touch();
                Ok((status, data))
            }
            Ok(Err(e)) => {
                entry.record_connection(&lease);
                Err(e)
            }
            Err(_) => {
                lease.mark_broken();
                entry.record_connection(&lease);
                Err(Error::Cancelled(format!(
                    "request deadline of {:?} expired",
                    config.request_timeout
                )))
            }
        }
    }

    /// The device configuration document as last accepted.
    pub async fn get_configuration(&self) -> String {
        self.shared.registry.read().await.raw_xml().to_string()
    }

    /// Replace the device configuration. Running sessions are untouched;
    /// collected parse warnings are returned.
    pub async fn put_configuration(&self, xml: &str) -> Result<Vec<String>> {
        let registry = AssemblyRegistry::from_xml(xml)?;
        let warnings = registry.warnings().to_vec();
        *self.shared.registry.write().await = registry;
        info!(
            "device configuration replaced ({} warnings)",
            warnings.len()
        );
        Ok(warnings)
    }

    pub async fn device_identity(&self) -> DeviceIdentity {
        self.shared.registry.read().await.identity().clone()
    }

    pub async fn resolve_assembly(&self, alias: &str) -> Result<Assembly> {
        self.shared
            .registry
            .read()
            .await
            .lookup(alias)
            .map(Assembly::clone)
    }

    /// Close every session and drain every pool.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> = {
            let mut sessions = self.shared.sessions.write().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.mark_closed();
        }
        let pools: Vec<Arc<Pool>> = {
            let mut pools = self.shared.pools.lock().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.drain().await;
        }
        info!("session manager shut down");
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>> {
        self.shared
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(session_id.to_string()))
    }

    async fn pool_for(&self, endpoint: &Endpoint) -> Arc<Pool> {
        let config = &self.shared.config;
        let mut pools = self.shared.pools.lock().await;
        Arc::clone(pools.entry(endpoint.clone()).or_insert_with(|| {
            Pool::new(
                endpoint.clone(),
                config.pool_size,
                connection_options(config),
            )
        }))
    }
}

pub(crate) fn connection_options(config: &CoreConfig) -> ConnectionOptions {
    ConnectionOptions {
        connect_timeout: config.connect_timeout,
        read_timeout: config.read_timeout,
    }
}

/// Bring a leased connection up to Connected, forward-opening if it is
/// only registered.
pub(crate) async fn ensure_connected(lease: &mut Lease) -> Result<()> {
    match lease.state() {
        ConnectionState::Connected => Ok(()),
        ConnectionState::Registered => lease.connect().await,
        state => Err(Error::transport(format!(
            "connection unusable in state {:?}",
            state
        ))),
    }
}

/// Random 128-bit URL-safe session id.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
