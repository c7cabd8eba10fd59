use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// One tenant's engine and the hub its notifications go out through.
#[derive(Clone)]
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = the name sent in the connection's hello.
pub struct TenantManager {
    tenants: DashMap<String, Tenant>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create the tenant. Names that sanitize to the same
    /// file name are the same tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Tenant> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }

        // Keep tenant names inside data_dir
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }
        if let Some(t) = self.tenants.get(&safe_name) {
            return Ok(t.value().clone());
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Two connections may race to create the same tenant; the entry lock
        // makes sure only one engine ever opens the WAL.
        let entry = self.tenants.entry(safe_name.clone());
        let tenant_ref = match entry {
            Entry::Occupied(o) => return Ok(o.get().clone()),
            Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let hub = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, hub.clone())?);

                let compactor_engine = engine.clone();
                let threshold = self.compact_threshold;
                tokio::spawn(async move {
                    compactor::run_compactor(compactor_engine, threshold).await;
                });

                info!(tenant = %safe_name, "tenant loaded");
                v.insert(Tenant { engine, hub }).clone()
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(tenant_ref)
    }
}
