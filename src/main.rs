//! egress-rota - Entry Point
//!
//! `probe` measures every node of the probe group and writes the results file,
//! `rotate` cycles the switch group through the usable nodes, and `doctor`
//! checks the controller is ready for a rotation run.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use egress_rota::config::LogConfig;
use egress_rota::controller::{ControlPlane, ControllerClient, IdentityProbe};
use egress_rota::repository::ResultsRepository;
use egress_rota::rotation::{RotationPool, RotationPoolConfig};
use egress_rota::services::{
    ControllerDoctor, CycleOutcome, IdentityVerdict, ProbeService, RotationService,
    RotationServiceConfig, ShutdownHandle,
};
use egress_rota::{Config, Result, RotaError};

const USAGE: &str = "usage: egress-rota <probe|rotate|doctor>";

#[derive(Debug, Clone, Copy)]
enum Command {
    Probe,
    Rotate,
    Doctor,
}

impl Command {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "probe" => Some(Command::Probe),
            "rotate" => Some(Command::Rotate),
            "doctor" => Some(Command::Doctor),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let Some(command) = std::env::args().nth(1).as_deref().and_then(Command::from_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(64);
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(&config.log);

    let outcome = match command {
        Command::Probe => run_probe(&config).await,
        Command::Rotate => run_rotate(&config).await,
        Command::Doctor => run_doctor(&config).await,
    };

    if let Err(e) = outcome {
        error!("{:?} failed: {}", command, e);
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("egress_rota={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_probe(config: &Config) -> Result<()> {
    let controller: Arc<dyn ControlPlane> = Arc::new(ControllerClient::new(&config.controller));
    let repository = ResultsRepository::new(&config.probe.results_path);
    let service = ProbeService::new(controller, &config.probe, repository);

    let mut progress = service.subscribe();
    let progress_task = tokio::spawn(async move {
        let mut last_decile = 0;
        while progress.changed().await.is_ok() {
            let p = *progress.borrow_and_update();
            let decile = (p.percent() / 10.0) as u32;
            if decile > last_decile || p.is_done() {
                last_decile = decile;
                info!(
                    "Progress {}/{} ({:.0}%): {} ok, {} failed",
                    p.completed,
                    p.total,
                    p.percent(),
                    p.ok,
                    p.failed
                );
            }
            if p.is_done() {
                break;
            }
        }
    });

    let report = tokio::select! {
        report = service.run() => report?,
        _ = shutdown_signal() => {
            progress_task.abort();
            return Err(RotaError::Internal(
                "probe run interrupted; results not written".to_string(),
            ));
        }
    };
    progress_task.abort();

    let results = &report.results;
    println!("Usable nodes ({}):", results.usable.len());
    for node in &results.usable {
        println!("  {:>8.0} ms  {}", node.latency_ms, node.name);
    }
    println!("Unusable nodes ({}):", results.unusable.len());
    for node in &results.unusable {
        println!("  {}  ({})", node.name, node.error);
    }
    if let Some(fastest) = results.fastest() {
        println!("Fastest: {} ({:.0} ms)", fastest.name, fastest.latency_ms);
    }
    println!(
        "Probed {} nodes in {:.1}s; results written to {}",
        results.counts().total(),
        report.elapsed.as_secs_f64(),
        config.probe.results_path.display()
    );

    Ok(())
}

async fn run_rotate(config: &Config) -> Result<()> {
    let results = ResultsRepository::new(&config.rotation.results_path)
        .load()
        .await?;

    let client = ControllerClient::new(&config.controller)
        .with_identity_probe(IdentityProbe::from_config(&config.rotation)?);
    let pool = RotationPool::new(
        Arc::new(client),
        &results,
        RotationPoolConfig::from(&config.rotation),
    );
    let mut service = RotationService::new(pool, RotationServiceConfig::from(&config.rotation));

    let (handle, shutdown) = ShutdownHandle::new();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received; stopping after the current cycle");
        handle.shutdown();
    });

    let summary = service.run(shutdown).await;
    signal_task.abort();
    let summary = summary?;

    for cycle in &summary.cycles {
        match &cycle.outcome {
            CycleOutcome::Switched { identity } => println!(
                "[{}/{}] {} -> {}",
                cycle.index,
                summary.requested,
                cycle.node,
                identity.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
            ),
            CycleOutcome::SwitchFailed { reason } => println!(
                "[{}/{}] {} switch failed: {}",
                cycle.index, summary.requested, cycle.node, reason
            ),
        }
    }

    let verdict = match summary.verdict() {
        IdentityVerdict::AllDistinct => "every cycle produced a different egress IP",
        IdentityVerdict::PartiallyShared => "some egress IPs were shared or unverified",
        IdentityVerdict::AllIdentical => "all cycles used the same egress IP",
        IdentityVerdict::Inconclusive => "not enough identities observed",
    };
    println!(
        "{} succeeded, {} failed, {} distinct identities: {}{}",
        summary.succeeded(),
        summary.failed(),
        summary.distinct_identities(),
        verdict,
        if summary.interrupted { " (interrupted)" } else { "" }
    );

    Ok(())
}

async fn run_doctor(config: &Config) -> Result<()> {
    let client = ControllerClient::new(&config.controller);
    let report = ControllerDoctor::new(client, &config.rotation).run().await?;

    println!("Controller: {}", config.controller.url);
    println!(
        "Mode: {}{}",
        report.initial_mode,
        if report.mode_changed { " -> global" } else { "" }
    );
    println!(
        "Ports: http={:?} socks={:?} mixed={:?}",
        report.configs.port, report.configs.socks_port, report.configs.mixed_port
    );
    println!(
        "Group {}: {} members, active {}",
        report.switch_group,
        report.group_members,
        report.active_node.as_deref().unwrap_or("-")
    );
    if !report.port_matches {
        println!(
            "Warning: mixed proxy port {} is not served by the controller",
            report.expected_port
        );
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
