// IGnet networker for Linux: polls neighbor nodes and moves spool files.

mod aide;
mod config;
mod connection;
mod dns;
mod event_loop;
mod job_queue;
mod poller;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use ignet_core::{SessionEnv, TalkingTo};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::aide::AideNotifier;
use crate::connection::Connector;
use crate::dns::SystemResolver;
use crate::event_loop::BoxedJob;
use crate::job_queue::JobQueue;
use crate::poller::Poller;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("ignet-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load()?;
    init_tracing(cfg.debug);
    info!(node = %cfg.node_name, neighbors = cfg.neighbors.len(), "starting");

    let dirs = cfg.spool_dirs();
    dirs.create_all().context("creating spool directories")?;

    let (trigger, shutdown) = event_loop::shutdown_pair();

    let db_queue: JobQueue<BoxedJob> = JobQueue::new();
    let db_loop = event_loop::spawn("ignet-db", db_queue.clone(), shutdown.clone())?;
    let client_queue: JobQueue<BoxedJob> = JobQueue::new();
    let client_loop = event_loop::spawn("ignet-client", client_queue.clone(), shutdown.clone())?;

    let env = SessionEnv {
        local_node: cfg.node_name.clone(),
        dirs,
        timeouts: cfg.timeouts(),
        notifier: Arc::new(AideNotifier::new(db_queue.clone(), cfg.spool.aide.clone())),
        talking: TalkingTo::new(),
        shutting_down: shutdown.flag(),
    };
    let connector = Arc::new(Connector {
        resolver: Arc::new(SystemResolver),
        bind: cfg.bind_address,
        connect_timeout: cfg.timeouts().connect,
    });
    let mut poller = Poller::new(
        cfg.neighbors.clone(),
        env,
        connector,
        client_queue.clone(),
        cfg.poll_interval(),
    );

    let rt = tokio::runtime::Runtime::new()?;
    let tick = cfg.poll_tick();
    rt.block_on(async {
        let mut interval = tokio::time::interval(tick);
        let signal = shutdown_signal();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    poller.tick(Instant::now());
                }
                r = &mut signal => {
                    r?;
                    break;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    info!(sessions = poller.sessions_started(), "shutting down");
    trigger.fire();
    client_queue.shutdown();
    join(client_loop, "ignet-client")?;
    // Notices raised while the client loop wound down are still written.
    db_queue.shutdown();
    join(db_loop, "ignet-db")?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "info,ignet_linux=debug,ignet_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn join(handle: std::thread::JoinHandle<()>, name: &str) -> anyhow::Result<()> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("{} loop panicked", name))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
