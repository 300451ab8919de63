use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use research_agent_api::{
    agents,
    build_state,
    config::{Config, ENV_VARS_DOCS},
    create_router,
    queue::{
        ConsumerLiveness, LocalSink, RedisTaskPublisher, ResultListener, ResultRelay, TaskConsumer, TaskQueue,
        UpdateSink,
    },
    utils::init_logger,
};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "research-agent-api", version, about = "Asynchronous research agent API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Server,
    /// Run a standalone task stream consumer
    Consumer,
    /// Print the environment variable reference
    EnvDocs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Server) {
        Command::EnvDocs => {
            print!("{}", ENV_VARS_DOCS);
            Ok(())
        }
        Command::Server => {
            let (config, _guard) = setup()?;
            run_server(config).await
        }
        Command::Consumer => {
            let (config, _guard) = setup()?;
            run_consumer(config).await
        }
    }
}

fn setup() -> anyhow::Result<(Config, Option<WorkerGuard>)> {
    let config = Config::from_env()?;
    let guard = init_logger(&config.logging);
    info!(environment = ?config.environment, "Configuration loaded");
    Ok((config, guard))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let runner = agents::from_config(&config.agent);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    // Shared with the publisher so a stopped embedded consumer sends
    // submissions back to inline execution
    let liveness = ConsumerLiveness::new();

    let publisher = if config.broker.enabled {
        match RedisTaskPublisher::connect(&config.broker).await {
            Ok(publisher) => {
                let publisher = if config.broker.consumer_embedded {
                    publisher.with_consumer(liveness.clone())
                } else {
                    publisher
                };
                background.push(publisher.spawn_heartbeat(config.broker.heartbeat));
                Some(publisher)
            }
            Err(e) => {
                warn!(error = %e, "Broker unavailable, tasks will run inline");
                None
            }
        }
    } else {
        info!("Broker disabled, tasks will run inline");
        None
    };
    let queue = publisher.map(|p| Arc::new(p) as Arc<dyn TaskQueue>);
    let state = build_state(config.clone(), runner.clone(), queue.clone());

    // Updates relayed by consumers in other processes
    let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let manager = state.manager.clone();
    let applier = tokio::spawn(async move { manager.run_updates(updates_rx).await });

    let mut consumer: Option<JoinHandle<()>> = None;
    if queue.is_some() {
        if config.broker.consumer_embedded {
            let relay = match ResultRelay::connect(&config.broker).await {
                Ok(relay) => Some(Arc::new(relay) as Arc<dyn UpdateSink>),
                Err(e) => {
                    warn!(error = %e, "Result relay unavailable, updates for tasks of other instances are dropped");
                    None
                }
            };
            let sink = Arc::new(LocalSink::new(state.manager.clone(), relay));

            match TaskConsumer::connect(&config.broker, runner.clone(), sink, config.tasks.timeout).await {
                Ok(task_consumer) => {
                    let task_consumer = task_consumer.with_retry_limit(None).with_liveness(liveness.clone());
                    let shutdown = shutdown_rx.clone();
                    consumer = Some(tokio::spawn(async move {
                        if let Err(e) = task_consumer.run(shutdown).await {
                            error!(error = %e, "Embedded consumer stopped");
                        }
                    }));
                }
                Err(e) => {
                    liveness.mark_dead();
                    warn!(error = %e, "Embedded consumer not started, tasks will run inline");
                }
            }
        }

        match ResultListener::connect(&config.broker).await {
            Ok(listener) => {
                let updates = updates_tx.clone();
                let shutdown = shutdown_rx.clone();
                background.push(tokio::spawn(async move {
                    if let Err(e) = listener.run(updates, shutdown).await {
                        error!(error = %e, "Result listener stopped");
                    }
                }));
            }
            Err(e) => warn!(error = %e, "Result listener not started"),
        }
    }
    drop(updates_tx);

    if let Some(retention) = config.tasks.retention {
        background.push(state.manager.spawn_retention_sweeper(retention));
    }

    let app = create_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let grace = config.tasks.shutdown_grace;

    if let Some(handle) = consumer {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("Embedded consumer did not stop within the grace period");
        }
    }
    let aborted = state.dispatcher.executor().drain(grace).await;
    if aborted > 0 {
        warn!(aborted, "Inline tasks aborted at shutdown");
    }

    for handle in background {
        handle.abort();
    }
    let _ = tokio::time::timeout(grace, applier).await;

    info!("Shutdown complete");
    Ok(())
}

async fn run_consumer(config: Config) -> anyhow::Result<()> {
    if !config.broker.enabled {
        anyhow::bail!("BROKER_ENABLED is false, nothing to consume");
    }

    let runner = agents::from_config(&config.agent);
    let relay = Arc::new(ResultRelay::connect(&config.broker).await?);
    let consumer = TaskConsumer::connect(&config.broker, runner, relay, config.tasks.timeout).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!(consumer = %config.broker.consumer_name, "Starting research task consumer");
    consumer.run(shutdown_rx).await?;

    info!("Consumer shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
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
