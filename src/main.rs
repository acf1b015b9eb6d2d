//! Media Allocator CLI
//!
//! ## Usage
//!
//! ```bash
//! # Register catalog rows
//! media-allocator add-recipient alice --weight 2 --quota 10
//! media-allocator add-item sha256-abc... --size 1048576 --locator blobs/abc
//!
//! # Run the engines once
//! media-allocator distribute
//! media-allocator distribute --quota-override 3
//! media-allocator expire --cooldown-days 7
//!
//! # Sweep expiry on an interval until Ctrl+C
//! media-allocator watch
//!
//! # Issue and check pickup links
//! MEDIA_ALLOCATOR_LINK_SECRET=... media-allocator mint 42 --ttl-hours 48
//! media-allocator authorize 'http://localhost:8090/pickup/42/...?sig=...'
//!
//! # Inspect
//! media-allocator runs --limit 20
//! media-allocator stats
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use media_allocator::config::LINK_SECRET_ENV;
use media_allocator::db::{NewItem, NewRecipient, RunKind};
use media_allocator::services::{
    spawn_listener, DistributionOptions, DistributionOutcome, ExpiryOptions, LoggingEventListener,
};
use media_allocator::{AllocatorDb, Config, Services};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "media-allocator")]
#[command(about = "Weighted media allocation with expiry sweeps and signed pickup links")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// HMAC secret for pickup link signatures
    #[arg(long, env = LINK_SECRET_ENV, hide_env_values = true)]
    link_secret: Option<String>,

    /// Sign links with the built-in development secret
    #[arg(long)]
    dev: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the distribution engine once
    Distribute {
        /// Cap every recipient at this many allocations for this run
        #[arg(long)]
        quota_override: Option<u32>,
    },

    /// Run the expiry sweep once
    Expire {
        #[arg(long)]
        cooldown_days: Option<u32>,
    },

    /// Run the expiry sweep periodically until interrupted
    Watch {
        /// Seconds between sweeps
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Mint a pickup link for an allocation
    Mint {
        allocation_id: i64,

        /// Pickup deadline from now; never extends an earlier deadline
        #[arg(long)]
        ttl_hours: Option<u64>,
    },

    /// Check a pickup link without consuming it
    Authorize { url: String },

    /// Register a recipient
    AddRecipient {
        name: String,
        #[arg(long, default_value_t = 1)]
        weight: u32,
        #[arg(long, default_value_t = 0)]
        quota: u32,
        #[arg(long)]
        email: Option<String>,
    },

    /// Register an ingested item
    AddItem {
        content_hash: String,
        #[arg(long, default_value_t = 0)]
        size: i64,
        #[arg(long)]
        locator: String,
    },

    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// distribution or expiry
        #[arg(long)]
        kind: Option<RunKind>,
    },

    /// Print database statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("media_allocator=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist (before the secret is merged in)
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    if let Some(secret) = args.link_secret {
        config.link_signing_secret = Some(secret);
    }

    let db = Arc::new(AllocatorDb::open(
        &config.db_path(),
        Duration::from_millis(config.busy_timeout_ms),
    )?);
    let services = Services::new(db, &config, args.dev)?;
    let _listener = spawn_listener(&services.events, LoggingEventListener);

    match args.command {
        Command::Distribute { quota_override } => {
            let outcome = services.distribution.run(DistributionOptions { quota_override })?;
            match &outcome {
                DistributionOutcome::Idle { run, reason } => {
                    println!("run {}: nothing to distribute ({:?})", run.id, reason);
                }
                DistributionOutcome::Distributed(report) => {
                    println!(
                        "run {}: assigned {}, skipped {}",
                        report.run.id, report.summary.assigned, report.summary.skipped
                    );
                }
            }
        }

        Command::Expire { cooldown_days } => {
            let options = expiry_options(&config, cooldown_days);
            let report = services.expiry.run(options)?;
            println!("run {}: expired {}", report.run.id, report.summary.expired);
        }

        Command::Watch { interval_secs } => {
            let period = Duration::from_secs(interval_secs.unwrap_or(config.sweep_interval_secs).max(1));
            let options = expiry_options(&config, None);
            info!(interval_secs = period.as_secs(), "Watching for overdue allocations");

            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expiry = services.expiry.clone();
                        match tokio::task::spawn_blocking(move || expiry.run(options)).await? {
                            Ok(report) => info!(run_id = report.run.id, expired = report.summary.expired, "Sweep finished"),
                            Err(e) => error!(error = %e, retryable = e.is_retryable(), "Sweep failed"),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }
        }

        Command::Mint { allocation_id, ttl_hours } => {
            let ttl = ttl_hours
                .map(|h| chrono::Duration::hours(h as i64))
                .unwrap_or_else(|| config.notify_ttl());
            let minted = services.links.mint(allocation_id, ttl)?;
            println!("{}", minted.url);
            if let Some(deadline) = minted.allocation.expires_at {
                info!(allocation_id, deadline = %deadline, link_expires_at = %minted.link_expires_at, "Link minted");
            }
        }

        Command::Authorize { url } => match services.links.authorize(&url) {
            Ok(allocation) => println!("ok: allocation {} ({})", allocation.id, allocation.status),
            Err(e) => match e.link_class() {
                Some(class) => {
                    warn!(class = class.as_str(), retryable = class.is_retryable(), "Link not authorized");
                    println!("{}", class.as_str());
                }
                None => return Err(e.into()),
            },
        },

        Command::AddRecipient { name, weight, quota, email } => {
            let recipient = services.admin.add_recipient(&NewRecipient {
                name,
                email,
                weight,
                weekly_quota: quota,
            })?;
            println!("recipient {}", recipient.id);
        }

        Command::AddItem { content_hash, size, locator } => {
            let item = services.admin.add_item(&NewItem::new(content_hash, size, locator))?;
            println!("item {}", item.id);
        }

        Command::Runs { limit, kind } => {
            for run in services.admin.list_runs(kind, limit)? {
                let stats = run.stats.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                let finished = run
                    .finished_at
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "UNFINISHED".into());
                println!("{}\t{}\t{}\t{}\t{}", run.id, run.kind, run.started_at.to_rfc3339(), finished, stats);
            }
        }

        Command::Stats => {
            let stats = services.admin.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn expiry_options(config: &Config, cooldown_days: Option<u32>) -> ExpiryOptions {
    ExpiryOptions {
        cooldown: chrono::Duration::days(i64::from(cooldown_days.unwrap_or(config.cooldown_days))),
        page_size: config.expiry_page_size,
    }
}
