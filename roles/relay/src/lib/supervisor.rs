//! Tenant supervisor.
//!
//! Owns the tenant table. Each tenant gets its four sockets bound and a
//! session task spawned; when the session reports back the sockets are gone,
//! so the supervisor rebinds and respawns. A periodic store re-scan picks up
//! tenants created by the external key-setter while the relay runs; tenants
//! are never retracted during a run. Per-tenant failures (a port already in
//! use, a record with nonsense ports) are logged and retried on the next
//! reload, never fatal.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use keydb::KeyStore;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    error::RelayResult,
    session::{Session, SessionSockets},
    status::{State, Status, StatusSender},
    task_manager::TaskManager,
};

pub struct Tenant {
    pub port1: u16,
    pub port2: u16,
    /// A session task currently owns this tenant's sockets.
    pub active: bool,
}

pub struct Supervisor {
    config: RelayConfig,
    tenants: HashMap<u16, Tenant>,
    status_tx: async_channel::Sender<Status>,
    status_rx: async_channel::Receiver<Status>,
    task_manager: Arc<TaskManager>,
}

impl Supervisor {
    /// Open the key store, register every valid record as a tenant and bind
    /// its sockets. A store that cannot be opened is fatal; everything after
    /// that is best-effort.
    pub fn bootstrap(config: RelayConfig) -> RelayResult<Self> {
        let (status_tx, status_rx) = async_channel::unbounded();
        let mut supervisor = Self {
            config,
            tenants: HashMap::new(),
            status_tx,
            status_rx,
            task_manager: Arc::new(TaskManager::new()),
        };

        let store = KeyStore::open(&supervisor.config.keydb_path)?;
        let mut records = Vec::new();
        store.traverse(|port2, record| records.push((port2, record.port1)))?;
        // close the store before binding; the operator tools share the lock
        drop(store);

        for (port2, port1) in records {
            supervisor.add_tenant(port1, port2);
        }
        info!("Added {} ports", supervisor.tenants.len());
        Ok(supervisor)
    }

    /// Register a tenant unless its port2 is already taken, then try to
    /// start serving it.
    fn add_tenant(&mut self, port1: i32, port2: u32) -> bool {
        let (Ok(port1), Ok(port2)) = (u16::try_from(port1), u16::try_from(port2)) else {
            warn!("Ignoring record with unusable ports {port1}/{port2}");
            return false;
        };
        if self.tenants.contains_key(&port2) {
            return false;
        }
        info!("Added port {port1}/{port2}");
        self.tenants.insert(
            port2,
            Tenant {
                port1,
                port2,
                active: false,
            },
        );
        self.spawn_session(port2);
        true
    }

    /// Bind the tenant's sockets and hand them to a fresh session task. Bind
    /// failure leaves the tenant idle for the next reload to retry.
    fn spawn_session(&mut self, port2: u16) {
        let Some(tenant) = self.tenants.get_mut(&port2) else {
            return;
        };
        if tenant.active {
            return;
        }
        let sockets = match SessionSockets::bind(&self.config.bind_address, tenant.port1, port2) {
            Ok(sockets) => sockets,
            Err(e) => {
                warn!("[{port2}] Failed to open ports {}/{port2}: {e}", tenant.port1);
                return;
            }
        };
        tenant.active = true;

        let session = Session::new(port2, sockets, self.config.clone());
        let status = StatusSender::new(self.status_tx.clone());
        self.task_manager.spawn(format!("session {port2}"), async move {
            session.run().await;
            status.send(State::SessionEnded { port2 }).await;
        });
        debug!("[{port2}] session task started");
    }

    /// Supervise until interrupted: reap ended sessions and rebind their
    /// sockets, reload the store on its interval.
    pub async fn run(mut self) -> RelayResult<()> {
        let reload_interval = self.config.reload_interval();
        let mut last_reload = Instant::now();
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                status = self.status_rx.recv() => {
                    match status?.state {
                        State::SessionEnded { port2 } => {
                            info!("[{port2}] session ended");
                            if let Some(tenant) = self.tenants.get_mut(&port2) {
                                tenant.active = false;
                            }
                            self.spawn_session(port2);
                        }
                        State::Healthy(msg) => debug!("HEALTHY message: {msg}"),
                    }
                }
                _ = tick.tick() => {
                    if last_reload.elapsed() >= reload_interval {
                        last_reload = Instant::now();
                        self.reload();
                    }
                }
                interrupt = tokio::signal::ctrl_c() => {
                    if let Err(e) = interrupt {
                        warn!("Unable to listen for interrupt signal: {e}");
                    } else {
                        info!("Interrupt received");
                    }
                    self.task_manager.abort_all();
                    return Ok(());
                }
            }
        }
    }

    /// Re-scan the store: new records become tenants, idle tenants get
    /// another bind attempt.
    fn reload(&mut self) {
        let store = match KeyStore::open(&self.config.keydb_path) {
            Ok(store) => store,
            Err(e) => {
                warn!("key store reload failed: {e}");
                return;
            }
        };
        let mut records = Vec::new();
        if let Err(e) = store.traverse(|port2, record| records.push((port2, record.port1))) {
            warn!("key store reload failed: {e}");
            return;
        }
        drop(store);

        for (port2, port1) in records {
            self.add_tenant(port1, port2);
        }
        let idle: Vec<u16> = self
            .tenants
            .values()
            .filter(|t| !t.active)
            .map(|t| t.port2)
            .collect();
        for port2 in idle {
            self.spawn_session(port2);
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_active(&self, port2: u16) -> Option<bool> {
        self.tenants.get(&port2).map(|t| t.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keydb::TenantRecord;
    use std::path::PathBuf;

    fn config_with_store(dir: &tempfile::TempDir) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.keydb_path = dir.path().join("keys.tdb");
        config.bind_address = "127.0.0.1".into();
        config
    }

    fn write_record(path: &PathBuf, port1: i32, port2: u32) {
        let store = KeyStore::open(path).unwrap();
        let mut record = TenantRecord::new();
        record.port1 = port1;
        let mut txn = store.begin().unwrap();
        txn.save(port2, &record).unwrap();
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn bootstrap_registers_and_serves_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_store(&dir);
        write_record(&config.keydb_path, 48761, 48762);

        let supervisor = Supervisor::bootstrap(config).unwrap();
        assert_eq!(supervisor.tenant_count(), 1);
        assert_eq!(supervisor.is_active(48762), Some(true));
    }

    #[tokio::test]
    async fn records_with_unusable_ports_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_store(&dir);
        write_record(&config.keydb_path, -5, 48763);
        write_record(&config.keydb_path, 48764, 900_000);

        let supervisor = Supervisor::bootstrap(config).unwrap();
        assert_eq!(supervisor.tenant_count(), 0);
    }

    #[tokio::test]
    async fn reload_picks_up_new_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_store(&dir);
        let path = config.keydb_path.clone();

        let mut supervisor = Supervisor::bootstrap(config).unwrap();
        assert_eq!(supervisor.tenant_count(), 0);

        write_record(&path, 48765, 48766);
        supervisor.reload();
        assert_eq!(supervisor.tenant_count(), 1);
        assert_eq!(supervisor.is_active(48766), Some(true));
    }

    #[tokio::test]
    async fn duplicate_port2_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_store(&dir);
        write_record(&config.keydb_path, 48767, 48768);

        let mut supervisor = Supervisor::bootstrap(config).unwrap();
        assert!(!supervisor.add_tenant(50000, 48768));
        assert_eq!(supervisor.tenant_count(), 1);
    }

    #[tokio::test]
    async fn missing_store_file_is_created_not_fatal() {
        // the store adapter creates the file, matching first-boot behavior
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_store(&dir);
        let supervisor = Supervisor::bootstrap(config).unwrap();
        assert_eq!(supervisor.tenant_count(), 0);
    }
}
