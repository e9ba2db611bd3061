//! edugo-sync — command-line front end for the bundle sync engine.
//!
//! Usage: edugo-sync <launch|full|delta|buckets [b1,b2]|status|clear|config>

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use edugo_sync::{Bucket, Config, LaunchOutcome, LocalSyncStore, SyncService, UserDataBundle};

const USAGE: &str = "Usage: edugo-sync <launch|full|delta|buckets [b1,b2,...]|status|clear|config>";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }

    if let Err(e) = run(&args).await {
        eprintln!("edugo-sync: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: &[String]) -> Result<()> {
    let command = args[0].as_str();
    if command == "config" {
        print!("{}", Config::example_config());
        return Ok(());
    }

    let config = Config::load()?;

    match command {
        "status" => {
            let store = LocalSyncStore::open(&config.sync.db_path()?)?;
            match store.restore().context("Failed to read local bundle")? {
                Some(bundle) => print_summary(&bundle),
                None => println!("No local bundle"),
            }
        }
        "clear" => {
            let store = LocalSyncStore::open(&config.sync.db_path()?)?;
            store.clear()?;
            println!("Local bundle cleared");
        }
        "launch" => {
            let service = SyncService::from_config(&config)?;
            match service.launch_sync().await? {
                LaunchOutcome::FullSync => println!("Fetched full bundle"),
                LaunchOutcome::Delta(buckets) if buckets.is_empty() => {
                    println!("Local bundle is up to date")
                }
                LaunchOutcome::Delta(buckets) => println!("Updated: {}", join(&buckets)),
                LaunchOutcome::FullSyncAfterDeltaFailure => {
                    println!("Delta failed; fetched full bundle")
                }
                LaunchOutcome::Offline(e) => println!("Offline, using local bundle ({e})"),
            }
            if let Some(bundle) = service.current_bundle().await {
                print_summary(&bundle);
            }
        }
        "full" => {
            let service = SyncService::from_config(&config)?;
            let bundle = service.full_sync().await?;
            print_summary(&bundle);
        }
        "delta" => {
            let service = SyncService::from_config(&config)?;
            let updated = service.delta_sync().await?;
            if updated.is_empty() {
                println!("Local bundle is up to date");
            } else {
                println!("Updated: {}", join(&updated));
            }
        }
        "buckets" => {
            let buckets = match args.get(1) {
                Some(list) => Bucket::parse_list(list)?,
                None => config.sync.default_buckets.clone(),
            };
            let service = SyncService::from_config(&config)?;
            let bundle = service.sync_buckets(&buckets).await?;
            print_summary(&bundle);
        }
        other => anyhow::bail!("unknown command {other:?}\n{USAGE}"),
    }

    Ok(())
}

fn join(buckets: &[Bucket]) -> String {
    buckets
        .iter()
        .map(Bucket::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_summary(bundle: &UserDataBundle) {
    println!("Synced at: {}", bundle.synced_at.to_rfc3339());
    for bucket in Bucket::ALL {
        match bundle.hash_of(bucket) {
            Some(hash) => println!("  {:<20} {}", bucket.as_str(), hash),
            None => println!("  {:<20} -", bucket.as_str()),
        }
    }
}
