use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use devopin_proto::ServiceStatus;

use crate::{catalog::Catalog, ledger::Ledger};

/// State shared by the monitoring loop and the control channel. Every lock
/// is held only to copy or swap values, never across I/O.
#[derive(Debug)]
pub struct SharedState {
    ledger: Mutex<Ledger>,
    catalog: RwLock<Arc<Catalog>>,
    statuses: RwLock<BTreeMap<String, ServiceStatus>>,
    allowed_services: Vec<String>,
}

impl SharedState {
    pub fn new(ledger: Ledger, catalog: Catalog, allowed_services: Vec<String>) -> Self {
        SharedState {
            ledger: Mutex::new(ledger),
            catalog: RwLock::new(Arc::new(catalog)),
            statuses: RwLock::new(BTreeMap::new()),
            allowed_services,
        }
    }

    pub fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swaps the catalog and forgets statuses of services it no longer monitors.
    pub fn replace_catalog(&self, catalog: Catalog) {
        let catalog = Arc::new(catalog);
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = catalog.clone();
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|name, _| {
                catalog.monitors(name) || self.allowed_services.iter().any(|s| s == name)
            });
    }

    /// Whether the control channel may act on `service`.
    pub fn is_known_service(&self, service: &str) -> bool {
        self.allowed_services.iter().any(|s| s == service) || self.catalog().monitors(service)
    }

    pub fn record_status(&self, status: ServiceStatus) {
        self.statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(status.name.clone(), status);
    }

    pub fn cached_statuses(&self) -> Vec<ServiceStatus> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_known_services() {
        let dir = tempfile::tempdir().unwrap();
        let state = SharedState::new(
            Ledger::load(dir.path().join("ledger.json")),
            Catalog::new(vec![], &["nginx".to_owned()], []),
            vec!["php8.2-fpm".to_owned()],
        );
        assert!(state.is_known_service("nginx"));
        assert!(state.is_known_service("php8.2-fpm"));
        assert!(!state.is_known_service("sshd"));

        state.replace_catalog(Catalog::new(vec![], &[], ["sshd".to_owned()]));
        assert!(state.is_known_service("sshd"));
        assert!(!state.is_known_service("nginx"));
    }

    #[test]
    fn test_catalog_change_prunes_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let state = SharedState::new(
            Ledger::load(dir.path().join("ledger.json")),
            Catalog::new(vec![], &["nginx".to_owned()], ["queue-worker".to_owned()]),
            vec!["php8.2-fpm".to_owned()],
        );
        for name in ["nginx", "queue-worker", "php8.2-fpm"] {
            state.record_status(ServiceStatus {
                name: name.to_owned(),
                active: true,
                enabled: true,
                status_text: "active (running)".to_owned(),
                uptime: Some(1),
                since: None,
            });
        }
        assert_eq!(state.cached_statuses().len(), 3);

        // the worker was removed on the backend
        state.replace_catalog(Catalog::new(vec![], &["nginx".to_owned()], []));
        let names: Vec<_> = state.cached_statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["nginx", "php8.2-fpm"]);
    }
}
