//! Load a manifest from disk and print the resulting status snapshot.
//!
//! ```text
//! rescoord <manifest.{json,yaml}> [--root DIR] [--policy sequential|parallel|bounded:N]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rescoord::{
    cancellation, ConcurrencyPolicy, Coordinator, FileFetcher, InitOptions, ManifestFile,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rescoord")]
#[command(version, about = "Load a resource manifest stage by stage")]
struct Cli {
    /// Manifest file (.json, .yaml or .yml)
    manifest: PathBuf,

    /// Directory locators resolve against (defaults to the manifest's directory)
    #[arg(long, env = "RESCOORD_ROOT")]
    root: Option<PathBuf>,

    /// Overrides the manifest's policy: sequential, parallel or bounded:N
    #[arg(long, value_parser = ConcurrencyPolicy::from_str)]
    policy: Option<ConcurrencyPolicy>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let (manifest, config) = ManifestFile::load(&args.manifest).await?.into_parts()?;

    let root = match args.root {
        Some(root) => root,
        None => args
            .manifest
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let coordinator = Coordinator::builder()
        .config(config)
        .fetcher(Arc::new(FileFetcher::new(root)))
        .build()?;

    let (cancel, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, letting dispatched loads settle");
            cancel.cancel();
        }
    });

    let mut options = InitOptions::new().with_cancel(signal);
    if let Some(policy) = args.policy {
        options = options.with_policy(policy);
    }

    let outcome = coordinator
        .initialize(&manifest, || info!("All stages settled"), options)
        .await;

    println!("{}", serde_json::to_string_pretty(&coordinator.status())?);

    if outcome.is_completed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
