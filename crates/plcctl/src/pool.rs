//! Fixed-capacity connection pool, one per PLC endpoint
//!
//! Lends a connection for the duration of one exchange. Broken
//! connections are discarded and lazily replaced; released connections go
//! to the first waiter in line, so acquisition is first-waiter-first-served.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::connection::{Connection, ConnectionOptions, ConnectionState, Endpoint};
use crate::error::{Error, Result};

type Waiter = oneshot::Sender<Option<Connection>>;

struct PoolInner {
    idle: Vec<Connection>,
    /// Connections alive or being built, never more than capacity.
    total: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

/// Pool of at most `capacity` connections to one endpoint.
pub struct Pool {
    endpoint: Endpoint,
    capacity: usize,
    options: ConnectionOptions,
    inner: Mutex<PoolInner>,
}

enum Plan {
    Ready(Connection),
    Build,
    Wait(oneshot::Receiver<Option<Connection>>),
}

impl Pool {
    pub fn new(endpoint: Endpoint, capacity: usize, options: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            capacity: capacity.max(1),
            options,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                total: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Borrow a registered connection, waiting up to `deadline` for one to
    /// become available. Empty slots are filled lazily; a broken
    /// connection coming off the idle list is discarded and replaced
    /// before being returned.
    pub async fn acquire(self: &Arc<Self>, deadline: Duration) -> Result<Lease> {
        let deadline = Instant::now() + deadline;
        loop {
            let plan = {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(Error::PoolClosed);
                }
                let mut ready = None;
                while let Some(connection) = inner.idle.pop() {
                    if connection.state() == ConnectionState::Broken {
                        inner.total -= 1;
                        debug!("discarding broken idle connection to {}", self.endpoint);
                        continue;
                    }
                    ready = Some(connection);
                    break;
                }
                match ready {
                    Some(connection) => Plan::Ready(connection),
                    None if inner.total < self.capacity => {
                        inner.total += 1;
                        Plan::Build
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        inner.waiters.push_back(tx);
                        Plan::Wait(rx)
                    }
                }
            };

            match plan {
                Plan::Ready(connection) => {
                    return self.ensure_open(connection, deadline).await;
                }
                Plan::Build => {
                    let connection = Connection::new(self.endpoint.clone(), self.options.clone());
                    return self.ensure_open(connection, deadline).await;
                }
                Plan::Wait(rx) => match timeout_at(deadline, rx).await {
                    Err(_) => return Err(Error::PoolTimeout),
                    Ok(Ok(Some(connection))) => {
                        return self.ensure_open(connection, deadline).await;
                    }
                    // capacity freed or pool drained: take another pass
                    Ok(Ok(None)) | Ok(Err(_)) => continue,
                },
            }
        }
    }

    /// Open the connection if it is not registered yet, then wrap it in a
    /// lease. Failures hand the slot back before propagating.
    async fn ensure_open(self: &Arc<Self>, mut connection: Connection, deadline: Instant) -> Result<Lease> {
        if connection.state() == ConnectionState::Closed {
            match timeout_at(deadline, connection.open()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.put_back(connection);
                    return Err(e);
                }
                Err(_) => {
                    connection.mark_broken();
                    self.put_back(connection);
                    return Err(Error::PoolTimeout);
                }
            }
        }
        Ok(Lease {
            connection: Some(connection),
            pool: Arc::clone(self),
        })
    }

    /// Take an idle connection if one is parked, without building or
    /// waiting. Used for teardown paths that only make sense against a
    /// live connection.
    pub fn try_acquire_idle(self: &Arc<Self>) -> Option<Lease> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        while let Some(connection) = inner.idle.pop() {
            if connection.state() == ConnectionState::Broken {
                inner.total -= 1;
                continue;
            }
            return Some(Lease {
                connection: Some(connection),
                pool: Arc::clone(self),
            });
        }
        None
    }

    /// Return a connection to the pool. Broken connections are discarded
    /// and their slot is offered to the first waiter; healthy ones go
    /// directly to the first waiter still listening, otherwise idle.
    fn put_back(&self, connection: Connection) {
        let mut inner = self.lock();
        if connection.state() == ConnectionState::Broken || inner.closed {
            inner.total -= 1;
            drop(connection);
            while let Some(waiter) = inner.waiters.pop_front() {
                if waiter.send(None).is_ok() {
                    break;
                }
            }
            return;
        }
        let mut connection = connection;
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(Some(connection)) {
                Ok(()) => return,
                Err(returned) => match returned {
                    // the waiter timed out; reclaim and keep looking
                    Some(reclaimed) => connection = reclaimed,
                    None => return,
                },
            }
        }
        inner.idle.push(connection);
    }

    /// Close every idle connection and reject all subsequent acquisitions
    /// with `PoolClosed`. Connections out on lease are dropped when they
    /// come back.
    pub async fn drain(&self) {
        let (idle, waiters) = {
            let mut inner = self.lock();
            inner.closed = true;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.waiters),
            )
        };
        for waiter in waiters {
            let _ = waiter.send(None);
        }
        for mut connection in idle {
            {
                let mut inner = self.lock();
                inner.total -= 1;
            }
            if let Err(e) = connection.close().await {
                debug!("closing {} during drain failed: {}", self.endpoint, e);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive loan of one pooled connection for one exchange.
pub struct Lease {
    connection: Option<Connection>,
    pool: Arc<Pool>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease connection taken before drop"))
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease connection taken before drop"))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.put_back(connection);
        }
    }
}
