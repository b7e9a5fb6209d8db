use std::path::PathBuf;

use devopin_proto::{
    FrameworkKind,
    msg::{ProjectRecord, WorkerRecord},
};
use log::warn;

use crate::{config::SourceConf, service::is_valid_service_name};

/// A project whose logs are parsed every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSource {
    pub name: String,
    /// Absolute, or relative to the configured base directory.
    pub log_path: PathBuf,
    pub framework: FrameworkKind,
}

impl ProjectSource {
    pub fn from_record(index: usize, record: &ProjectRecord) -> Result<Self, String> {
        let log_path = record
            .log_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| format!("project #{index} has no log_path"))?;
        let framework = record
            .framework_type
            .as_deref()
            .ok_or_else(|| format!("project #{index} has no framework_type"))?
            .parse::<FrameworkKind>()?;

        let name = match (&record.name, &record.id) {
            (Some(name), _) if !name.trim().is_empty() => name.trim().to_owned(),
            (_, Some(serde_json::Value::String(id))) => id.clone(),
            (_, Some(serde_json::Value::Number(id))) => format!("project-{id}"),
            _ => format!("{framework}-{index}"),
        };
        Ok(ProjectSource {
            name,
            log_path: PathBuf::from(log_path.trim()),
            framework,
        })
    }
}

impl From<&SourceConf> for ProjectSource {
    fn from(conf: &SourceConf) -> Self {
        ProjectSource {
            name: conf.name.clone(),
            log_path: conf.log_path.clone(),
            framework: conf.framework_type,
        }
    }
}

/// Snapshot of what the agent monitors; replaced as a whole when the
/// backend answers, read without locking for the rest of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub projects: Vec<ProjectSource>,
    pub services: Vec<String>,
}

impl Catalog {
    pub fn new(
        projects: Vec<ProjectSource>,
        default_services: &[String],
        workers: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut services: Vec<String> = Vec::new();
        for name in default_services.iter().cloned().chain(workers) {
            if !is_valid_service_name(&name) {
                warn!("ignoring invalid service name {name:?}");
                continue;
            }
            if !services.contains(&name) {
                services.push(name);
            }
        }
        Catalog { projects, services }
    }

    pub fn projects_from_records(records: &[ProjectRecord]) -> Vec<ProjectSource> {
        records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                ProjectSource::from_record(index, record)
                    .inspect_err(|e| warn!("skipping project: {e}"))
                    .ok()
            })
            .collect()
    }

    pub fn worker_names(records: &[WorkerRecord]) -> impl Iterator<Item = String> + '_ {
        records.iter().map(|w| w.name().trim().to_owned())
    }

    pub fn monitors(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}
