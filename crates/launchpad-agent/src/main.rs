use std::sync::Arc;

use launchpad_agent::{
    catalog::DirectoryCatalog, config::AgentConfig, http, orchestrator::Orchestrator,
    reconcile::OrphanSweeper,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(cfg: &AgentConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "launchpad-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter()).init();
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env()?;
    let _log_guard = init_tracing(&cfg);

    tokio::fs::create_dir_all(cfg.envs_root()).await?;
    tokio::fs::create_dir_all(&cfg.projects_root).await?;

    let catalog = Arc::new(DirectoryCatalog::new(&cfg.projects_root));
    let listen_addr = cfg.listen_addr;
    let sweep_interval = cfg.sweep_interval;
    tracing::info!(
        port_min = cfg.port_min,
        port_max = cfg.port_max,
        data_root = %cfg.data_root.display(),
        projects_root = %cfg.projects_root.display(),
        template_id = %cfg.template_id,
        sandbox = %cfg.sandbox.summary(),
        "launchpad-agent starting"
    );

    let orchestrator = Orchestrator::new(cfg, catalog);
    orchestrator.reconcile().await;
    OrphanSweeper::new(orchestrator.clone(), sweep_interval).spawn();

    let app = http::router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "launchpad-agent HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let summary = orchestrator.stop_all().await;
    tracing::info!(
        sessions_stopped = summary.sessions_stopped,
        ports_freed = summary.ports_freed,
        "launchpad-agent stopped"
    );
    Ok(())
}
