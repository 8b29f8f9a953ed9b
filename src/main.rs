//! Helmsman - CLI driver
//!
//! Thin shell around the connection core: loads the core configuration and
//! a profile list, issues the initial connect and mirrors every status
//! event into the log. A desktop shell would replace this file, not the
//! library behind it.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use helmsman::engine::generate;
use helmsman::probe::runner;
use helmsman::profile::{ProfileId, ServerProfile, SharedSettings, StaticProfileSource};
use helmsman::{ConnectionCore, ConnectionStatus, CoreConfig, StatusEvent, Target, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "helmsman")]
#[command(version = VERSION)]
#[command(about = "Connection core for a desktop proxy client")]
struct Args {
    /// Path to the core configuration file (defaults apply when missing)
    #[arg(short = 'c', long = "config", default_value = "core.yaml")]
    config: PathBuf,

    /// JSON file with the server profile list
    #[arg(short = 'p', long = "profiles")]
    profiles: PathBuf,

    /// Connect to the best candidate of this group
    #[arg(short = 'g', long = "group", conflicts_with = "profile")]
    group: Option<String>,

    /// Connect to one profile by id
    #[arg(long = "profile")]
    profile: Option<ProfileId>,

    /// Enable automatic failover regardless of the config file
    #[arg(long = "auto-failover")]
    auto_failover: bool,

    /// Debug logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Validate an engine config per profile and exit; spawns nothing
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // Build a runtime sized for a workload that is mostly waiting on
    // processes and sockets
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("helmsman-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "helmsman=debug" } else { "helmsman=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?),
        )
        .init();

    info!("Helmsman v{}", VERSION);

    let mut config = if args.config.exists() {
        info!("Loading configuration from {}", args.config.display());
        match CoreConfig::load_async(&args.config).await {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("No configuration at {}, using defaults", args.config.display());
        CoreConfig::default()
    };

    if args.auto_failover {
        config.failover.enabled = true;
    }

    let profiles = match load_profiles(&args.profiles).await {
        Ok(profiles) => profiles,
        Err(e) => {
            error!("Failed to load profiles: {}", e);
            std::process::exit(1);
        }
    };
    info!("Loaded {} profiles", profiles.len());

    if args.test {
        return run_config_test(&profiles, &config);
    }

    let target = match (&args.profile, &args.group) {
        (Some(id), _) => Target::Profile(*id),
        (None, Some(group)) => Target::Group(group.clone()),
        (None, None) => {
            error!("Either --group or --profile is required");
            std::process::exit(2);
        }
    };

    let http_port = config.network.http_port;
    let external_ip_url = config.probe.external_ip_url.clone();
    let url_timeout = config.probe.url_timeout();
    let network = config.network.clone();

    let core = ConnectionCore::new(
        config,
        Arc::new(StaticProfileSource::new(profiles)),
        Arc::new(SharedSettings::new(network)),
    );

    // Mirror the feed into the log; what a desktop shell would render
    let mut feed = core.subscribe();
    tokio::spawn(async move {
        let mut exit_checked = false;
        loop {
            match feed.recv().await {
                Ok(StatusEvent::Connection(state)) => {
                    match (&state.status, &state.last_error) {
                        (ConnectionStatus::Error, Some(reason)) => {
                            error!("[{}] {}", state.status, reason)
                        }
                        (status, _) => match state.active_profile_id {
                            Some(id) => info!("[{}] profile {}", status, id),
                            None => info!("[{}]", status),
                        },
                    }
                    if state.status == ConnectionStatus::Connected && !exit_checked {
                        exit_checked = true;
                        let url = external_ip_url.clone();
                        tokio::spawn(async move {
                            match runner::external_ip(http_port, &url, url_timeout).await {
                                Ok(ip) => info!("Exit IP: {}", ip),
                                Err(e) => debug!("Exit IP check failed: {}", e),
                            }
                        });
                    }
                    if state.status == ConnectionStatus::Idle {
                        exit_checked = false;
                    }
                }
                Ok(StatusEvent::Health(samples)) => {
                    for sample in samples {
                        debug!(
                            "health {} {:?} via {:?}",
                            sample.profile_id, sample.outcome, sample.method
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Status feed lagged, skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let handle = core.handle();
    if let Err(e) = handle.connect(target).await {
        error!("Connect failed: {}", e);
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    core.shutdown().await;
    info!("Helmsman stopped");
    Ok(())
}

async fn load_profiles(path: &PathBuf) -> anyhow::Result<Vec<ServerProfile>> {
    let content = tokio::fs::read_to_string(path).await?;
    let profiles: Vec<ServerProfile> = serde_json::from_str(&content)?;
    Ok(profiles)
}

/// `--test`: generate and validate a config document for every profile.
fn run_config_test(profiles: &[ServerProfile], config: &CoreConfig) -> anyhow::Result<()> {
    let mut failures = 0usize;
    for profile in profiles {
        match generate(profile, &config.network) {
            Ok(_) => info!("ok    {} ({})", profile.name, profile.protocol_name()),
            Err(e) => {
                failures += 1;
                error!("FAIL  {} ({}): {}", profile.name, profile.protocol_name(), e);
            }
        }
    }
    if failures > 0 {
        error!("{} of {} profiles failed validation", failures, profiles.len());
        std::process::exit(1);
    }
    info!("All {} profiles validated", profiles.len());
    Ok(())
}
