#![forbid(unsafe_code)]

use std::{path::PathBuf, sync::Arc};

use argh::FromArgs;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::BackendClient,
    catalog::{Catalog, ProjectSource},
    config::Conf,
    control::ControlServer,
    ledger::Ledger,
    orchestrator::{CycleSettings, Orchestrator},
    service::{ServiceMonitor, systemctl::Systemctl},
    spool::Spool,
    state::SharedState,
};

mod backend;
mod catalog;
mod config;
mod control;
mod http_util;
mod ledger;
mod lock;
mod metrics;
mod orchestrator;
mod parser;
mod service;
mod spool;
mod state;

#[derive(FromArgs, Debug)]
#[argh(description = "Host monitoring agent: log parsing, metrics, services and a local control socket.")]
struct AgentArgs {
    #[argh(
        option,
        short = 'c',
        description = "configuration file (default: ./config.toml, then /etc/devopin-agent/config.toml)"
    )]
    pub config: Option<PathBuf>,
    #[argh(switch, description = "run a single monitoring cycle and exit")]
    pub once: bool,
    #[argh(switch, description = "do not open the control socket")]
    pub no_control: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    let args: AgentArgs = argh::from_env();
    log::debug!("Agent args: {args:#?}");
    let conf = Conf::load(args.config.as_deref())?;
    log::debug!("Agent config: {conf:#?}");

    let ledger = Ledger::load(conf.agent.ledger_path());
    log::info!(
        "ledger {} holds {} cursor(s)",
        ledger.path().display(),
        ledger.cursors().len()
    );
    let static_projects: Vec<ProjectSource> =
        conf.logs.sources.iter().map(ProjectSource::from).collect();
    let state = Arc::new(SharedState::new(
        ledger,
        Catalog::new(static_projects.clone(), &conf.agent.default_services, []),
        conf.agent.allowed_services.clone(),
    ));
    let services = Arc::new(ServiceMonitor::new(
        Systemctl::new(conf.agent.service_command_timeout()),
        conf.agent.restart_delay(),
    ));
    let backend = match &conf.agent.backend_url {
        Some(url) => Some(BackendClient::new(
            url,
            conf.agent.request_timeout(),
            conf.agent.prefer_ipv6,
        )?),
        None => {
            log::warn!("no backend configured, payloads are only spooled");
            None
        }
    };
    let spool = Spool::new(conf.agent.spool_path(), conf.agent.spool_max_records);
    match spool.len().await {
        Ok(0) => {}
        Ok(pending) => log::info!("{pending} spooled payload(s) wait for delivery"),
        Err(e) => log::warn!("unable to read spool {}: {e}", spool.path().display()),
    }
    let orchestrator = Orchestrator::new(
        CycleSettings {
            interval: conf.agent.interval(),
            base_dir: conf.logs.base_dir(),
            limits: conf.logs.limits(),
            static_projects,
            default_services: conf.agent.default_services.clone(),
        },
        state.clone(),
        services.clone(),
        backend,
        spool,
    );

    if args.once {
        let report = orchestrator.run_cycle().await;
        log::info!(
            "single cycle: {} entries, {} services, delivered: {}, spooled: {}",
            report.entries,
            report.services,
            report.delivered,
            report.spooled
        );
        for e in &report.errors {
            log::warn!("{e}");
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("interrupted, shutting down"),
                _ = sigterm.recv() => log::info!("terminated, shutting down"),
            }
            shutdown.cancel();
        });
    }

    let control = if args.no_control {
        None
    } else {
        // a socket that cannot be bound is fatal
        let listener = control::bind(&conf.control.socket_path, conf.control.socket_mode)?;
        let server = Arc::new(ControlServer::new(
            state.clone(),
            services.clone(),
            conf.control.command_timeout(),
            conf.control.stream_grace(),
            conf.control.stream_backlog_lines,
        ));
        Some(tokio::spawn(server.serve(listener, shutdown.clone())))
    };

    orchestrator.run(shutdown.clone()).await;

    if let Some(control) = control {
        if let Err(e) = control.await {
            log::error!("control channel task failed: {e}");
        }
        control::remove_socket(&conf.control.socket_path);
    }
    orchestrator.flush_ledger().await;
    log::info!("agent stopped");
    Ok(())
}
