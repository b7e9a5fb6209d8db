use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use devopin_proto::{HostInfo, LogEntry, MonitoringPayload, ServiceStatus, SystemMetricsSnapshot};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::BackendClient,
    catalog::{Catalog, ProjectSource},
    ledger::Cursor,
    metrics::MetricsCollector,
    parser::{self, ParseLimits},
    service::{ServiceError, ServiceManager, ServiceMonitor},
    spool::Spool,
    state::SharedState,
};

/// Static inputs of the monitoring loop.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub interval: Duration,
    pub base_dir: PathBuf,
    pub limits: ParseLimits,
    pub static_projects: Vec<ProjectSource>,
    pub default_services: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub sources: usize,
    pub entries: usize,
    pub services: usize,
    pub errors: Vec<String>,
    pub delivered: bool,
    pub spooled: bool,
    pub replayed: usize,
}

#[derive(Default)]
struct ParsedLogs {
    logs: BTreeMap<String, Vec<LogEntry>>,
    /// Cursor per source, flagged when the file was rotated or truncated.
    cursors: Vec<(String, Cursor, bool)>,
    sources: usize,
    errors: Vec<String>,
}

pub struct Orchestrator<M> {
    settings: CycleSettings,
    state: Arc<SharedState>,
    services: Arc<ServiceMonitor<M>>,
    backend: Option<BackendClient>,
    spool: Spool,
    collector: Arc<Mutex<MetricsCollector>>,
    host: HostInfo,
}

impl<M: ServiceManager> Orchestrator<M> {
    pub fn new(
        settings: CycleSettings,
        state: Arc<SharedState>,
        services: Arc<ServiceMonitor<M>>,
        backend: Option<BackendClient>,
        spool: Spool,
    ) -> Self {
        Self {
            settings,
            state,
            services,
            backend,
            spool,
            collector: Arc::new(Mutex::new(MetricsCollector::new())),
            host: MetricsCollector::host_info(),
        }
    }

    /// Runs cycles until `shutdown` fires. A cycle in flight is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let started = Instant::now();
            let report = self.run_cycle().await;
            info!(
                "cycle done in {:?}: {} entries from {} sources, {} services, {} errors, {}",
                started.elapsed(),
                report.entries,
                report.sources,
                report.services,
                report.errors.len(),
                if report.delivered {
                    "delivered"
                } else if report.spooled {
                    "spooled"
                } else {
                    "lost"
                }
            );

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep_until(started + self.settings.interval) => {}
            }
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let catalog = self.refresh_catalog(&mut report.errors).await;

        let parsed = self.parse_logs(&catalog).await;
        report.sources = parsed.sources;
        report.entries = parsed.logs.values().map(Vec::len).sum();
        report.errors.extend(parsed.errors);

        let system_metrics = self.sample_metrics(&mut report.errors).await;

        let services = self.query_services(&catalog, &mut report.errors).await;
        report.services = services.len();

        let payload = MonitoringPayload {
            timestamp: OffsetDateTime::now_utc(),
            host: self.host.clone(),
            logs: parsed.logs,
            system_metrics,
            services,
            errors: report.errors.clone(),
        };

        // the backlog goes first so the backend sees payloads in order
        let backlog_drained = match &self.backend {
            Some(_) => {
                let (replayed, drained) = self.replay_spool().await;
                report.replayed = replayed;
                drained
            }
            None => false,
        };
        report.delivered = match &self.backend {
            Some(backend) if backlog_drained => match backend.upload(&payload).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("upload failed, spooling payload: {e}");
                    false
                }
            },
            _ => false,
        };
        if !report.delivered {
            report.spooled = match self.spool.push(&payload).await {
                Ok(()) => true,
                Err(e) => {
                    error!("unable to spool payload: {e}");
                    false
                }
            };
        }

        // cursors only move once the entries are safe somewhere
        if report.delivered || report.spooled {
            let mut ledger = self.state.ledger();
            for (source_id, cursor, rotated) in &parsed.cursors {
                if *rotated {
                    ledger.reset(source_id, *cursor);
                } else {
                    ledger.update(source_id, *cursor);
                }
            }
        }
        self.flush_ledger().await;

        report
    }

    async fn refresh_catalog(&self, errors: &mut Vec<String>) -> Arc<Catalog> {
        let previous = self.state.catalog();
        let Some(backend) = &self.backend else {
            return previous;
        };

        let (projects, workers) = tokio::join!(backend.fetch_projects(), backend.fetch_workers());
        let mut fresh = true;
        let mut projects = match projects {
            Ok(records) => Catalog::projects_from_records(&records),
            Err(e) => {
                warn!("unable to fetch projects, keeping {} known: {e}", previous.projects.len());
                errors.push(format!("fetch projects: {e}"));
                fresh = false;
                previous.projects.clone()
            }
        };
        let workers: Vec<String> = match workers {
            Ok(records) => Catalog::worker_names(&records).collect(),
            Err(e) => {
                warn!("unable to fetch workers, keeping {} known: {e}", previous.services.len());
                errors.push(format!("fetch workers: {e}"));
                fresh = false;
                previous.services.clone()
            }
        };
        for project in &self.settings.static_projects {
            if !projects.iter().any(|p| p.name == project.name) {
                projects.push(project.clone());
            }
        }

        let catalog = Catalog::new(projects, &self.settings.default_services, workers);
        if fresh {
            debug!(
                "catalog refreshed: {} projects, {} services",
                catalog.projects.len(),
                catalog.services.len()
            );
        }
        self.state.replace_catalog(catalog);
        self.state.catalog()
    }

    async fn parse_logs(&self, catalog: &Catalog) -> ParsedLogs {
        let cursors = self.state.ledger().cursors().clone();
        let projects = catalog.projects.clone();
        let base_dir = self.settings.base_dir.clone();
        let limits = self.settings.limits;

        let task = tokio::task::spawn_blocking(move || {
            let mut parsed = ParsedLogs::default();
            for project in &projects {
                let sources = match parser::discover_sources(project, &base_dir) {
                    Ok(sources) => sources,
                    Err(e) => {
                        warn!("project {}: {e}", project.name);
                        parsed.errors.push(format!("project {}: {e}", project.name));
                        continue;
                    }
                };
                for mut source in sources {
                    parsed.sources += 1;
                    source.last_cursor = cursors.get(&source.source_id).copied();
                    match parser::parse_new_entries(&source, &limits) {
                        Ok(outcome) => {
                            if outcome.skipped_lines > 0 {
                                debug!(
                                    "{}: skipped {} lines",
                                    source.source_id, outcome.skipped_lines
                                );
                            }
                            parsed.cursors.push((
                                source.source_id.clone(),
                                outcome.cursor,
                                outcome.rotated,
                            ));
                            parsed.logs.insert(source.source_id, outcome.entries);
                        }
                        Err(e) => {
                            warn!("source {}: {e}", source.source_id);
                            parsed.errors.push(format!("source {}: {e}", source.source_id));
                        }
                    }
                }
            }
            parsed
        });

        task.await.unwrap_or_else(|e| {
            error!("log parsing task failed: {e}");
            ParsedLogs {
                errors: vec![format!("log parsing task failed: {e}")],
                ..Default::default()
            }
        })
    }

    async fn sample_metrics(&self, errors: &mut Vec<String>) -> SystemMetricsSnapshot {
        let collector = self.collector.clone();
        let task = tokio::task::spawn_blocking(move || {
            collector
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sample()
        });
        match task.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("metrics task failed: {e}");
                errors.push(format!("metrics: {e}"));
                MetricsCollector::empty_snapshot()
            }
        }
    }

    async fn query_services(&self, catalog: &Catalog, errors: &mut Vec<String>) -> Vec<ServiceStatus> {
        let results = join_all(
            catalog
                .services
                .iter()
                .map(|name| async move { (name, self.services.status(name).await) }),
        )
        .await;

        let mut statuses = Vec::with_capacity(results.len());
        for (name, result) in results {
            let status = match result {
                Ok(status) => status,
                Err(ServiceError::NotFound(_)) => ServiceStatus {
                    name: name.clone(),
                    active: false,
                    enabled: false,
                    status_text: "not-found".to_owned(),
                    uptime: None,
                    since: None,
                },
                Err(e) => {
                    warn!("service {name}: {e}");
                    errors.push(format!("service {name}: {e}"));
                    continue;
                }
            };
            self.state.record_status(status.clone());
            statuses.push(status);
        }
        statuses
    }

    /// Delivers spooled payloads oldest first, stopping at the first failure.
    /// Returns how many were delivered and whether the spool is now empty.
    async fn replay_spool(&self) -> (usize, bool) {
        let Some(backend) = &self.backend else {
            return (0, false);
        };
        let pending = match self.spool.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("unable to read spool: {e}");
                return (0, false);
            }
        };

        let mut delivered = 0;
        for payload in &pending {
            if let Err(e) = backend.upload(payload).await {
                warn!("replay stopped after {delivered} payload(s): {e}");
                break;
            }
            delivered += 1;
        }
        if delivered == 0 {
            return (0, pending.is_empty());
        }
        info!("replayed {delivered} spooled payload(s)");
        match self.spool.remove_first(delivered).await {
            Ok(()) => (delivered, delivered == pending.len()),
            Err(e) => {
                error!("unable to trim spool: {e}");
                (delivered, false)
            }
        }
    }

    /// Writes the ledger; a failure is retried on the next cycle.
    pub async fn flush_ledger(&self) {
        let ledger = self.state.ledger().clone();
        match tokio::task::spawn_blocking(move || ledger.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("unable to flush ledger, retrying next cycle: {e}"),
            Err(e) => warn!("ledger flush task failed: {e}"),
        }
    }
}
