use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lumisync::{
    run_push_listener, system_clock, Config, Directory, DocumentClient, HostGateway, IdGenerator,
    LockCoordinator, RequestOptions, SyncOrchestrator, SyncableStore,
};

#[derive(Parser)]
#[command(name = "lumisync")]
#[command(version)]
#[command(about = "Fleet synchronization for embedded lighting controllers", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization cycle across the fleet
    Sync,
    /// Keep syncing on an interval, following push updates
    Watch {
        /// Seconds between cycles
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },
    /// Show configuration and per-controller reachability
    Status,
    /// Refresh and list the controller directory
    Hosts,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lumisync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

struct Stack {
    client: DocumentClient,
    directory: Directory,
    store: SyncableStore,
    orchestrator: SyncOrchestrator,
}

fn build_stack(config: &Config) -> Stack {
    let gateway = Arc::new(HostGateway::new(config.gateway_policy()));
    let client = DocumentClient::new(gateway);
    let directory = Directory::spawn();
    let clock = system_clock();
    let device_id = config.controller_id.clone().unwrap_or_else(|| "local".to_string());

    let store = SyncableStore::new(
        client.clone(),
        directory.clone(),
        clock.clone(),
        IdGenerator::new(device_id),
    );
    let lock = LockCoordinator::new(client.clone(), clock.clone(), config.lock_settings());
    let orchestrator = SyncOrchestrator::new(
        client.clone(),
        directory.clone(),
        lock,
        clock,
        config.sync_settings(),
    );

    Stack {
        client,
        directory,
        store,
        orchestrator,
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Sync) => sync_once(&config).await,
        Some(Commands::Watch { interval }) => watch(&config, interval).await,
        Some(Commands::Status) => status(&config).await,
        Some(Commands::Hosts) => hosts(&config).await,
        None => {
            println!("Use --help to see available commands");
            Ok(())
        }
    }
}

async fn sync_once(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let stack = build_stack(config);
    let count = stack.directory.refresh(&stack.client, &config.entry_host).await?;
    println!("Syncing {} controller(s)...", count);

    let merged = stack
        .orchestrator
        .synchronize(|done, total| println!("  {}/{} controllers", done, total))
        .await;

    match merged {
        Some(merged) => {
            stack.store.apply_merged(merged);
            let data = stack.store.snapshot();
            println!();
            println!(
                "Sync complete: {} preset(s), {} scene(s), {} group(s).",
                data.presets.len(),
                data.scenes.len(),
                data.groups.len()
            );
            let failed = stack.orchestrator.last_failed_hosts();
            if !failed.is_empty() {
                println!("Unreachable: {}", failed.join(", "));
            }
            Ok(())
        }
        None => Err("sync did not complete".into()),
    }
}

async fn watch(config: &Config, interval: u64) -> Result<(), Box<dyn std::error::Error>> {
    let stack = build_stack(config);

    if let Some(push_url) = &config.push_url {
        tokio::spawn(run_push_listener(push_url.clone(), stack.directory.clone()));
    }

    loop {
        if let Err(e) = stack.directory.refresh(&stack.client, &config.entry_host).await {
            eprintln!("Directory refresh failed: {}", e);
        }

        match stack.orchestrator.synchronize(|_, _| {}).await {
            Some(merged) => {
                stack.store.apply_merged(merged);
                let data = stack.store.snapshot();
                println!(
                    "Synced: {} preset(s), {} scene(s), {} group(s).",
                    data.presets.len(),
                    data.scenes.len(),
                    data.groups.len()
                );
            }
            None => eprintln!("Sync cycle did not complete"),
        }
        stack.orchestrator.force_resync();

        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

async fn status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Sync Configuration");
    println!("==================");
    println!();
    println!("Entry host:     {}", config.entry_host);
    println!(
        "Controller id:  {}",
        config.controller_id.as_deref().unwrap_or("(auto)")
    );
    println!("Request timeout: {}ms", config.request_timeout_ms);
    println!("Max retries:     {}", config.max_retries);
    println!("Host throttle:   {}ms", config.host_throttle_ms);
    println!(
        "Sync lock:       {}",
        if config.use_sync_lock {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!();

    let stack = build_stack(config);
    match stack.directory.refresh(&stack.client, &config.entry_host).await {
        Ok(count) => println!("Directory: {} controller(s)", count),
        Err(e) => {
            println!("Directory: ✗ unreachable ({})", e);
            return Ok(());
        }
    }

    // single short probe per host; the usual retry budget would make
    // an offline fleet take minutes to report
    let probe = RequestOptions {
        timeout: Some(Duration::from_secs(2)),
        max_retries: Some(0),
    };
    for controller in stack.directory.snapshot().await {
        print!("  {} ({}): ", controller.label(), controller.ip_address);
        let result = stack
            .client
            .gateway()
            .execute(
                &controller.ip_address,
                reqwest::Method::GET,
                "info",
                None,
                &probe,
            )
            .await;
        match result {
            Ok(_) => println!("✓ reachable"),
            Err(e) => println!("✗ {}", e),
        }
    }

    Ok(())
}

async fn hosts(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let stack = build_stack(config);
    let count = stack.directory.refresh(&stack.client, &config.entry_host).await?;
    println!("{} controller(s):", count);
    for c in stack.directory.snapshot().await {
        println!(
            "  {}  {}  {}{}",
            c.id,
            c.label(),
            c.ip_address,
            if c.visible { "" } else { "  (hidden)" }
        );
    }
    Ok(())
}
