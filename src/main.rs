mod app;
mod cache;
mod config;
mod connectivity;
mod datasets;
mod db;
mod error;
mod event;
mod logging;
mod net;
mod status;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "aqua-offline")]
#[command(about = "Offline cache, local store and sync queue for the AquaSphere field app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/aqua-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Application origin, e.g. http://localhost:5000
  #[arg(short, long, global = true)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Provision the current cache generation and purge older ones
  Install,
  /// Fetch a URL through the cache tiers
  Fetch {
    url: String,
    /// Fetch as a page navigation
    #[arg(long)]
    html: bool,
  },
  /// Queue a prediction for delivery
  Enqueue {
    /// Prediction type, e.g. disease
    kind: String,
    /// Inputs as JSON
    inputs: String,
    /// Output as JSON
    output: String,
  },
  /// Deliver queued predictions
  Flush,
  /// Refresh reference datasets from the server
  Refresh,
  /// Show offline readiness
  Status,
  /// Follow connectivity and deliver predictions on reconnect
  Watch,
  /// Re-cache application routes
  Recache {
    #[arg(required = true)]
    routes: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let _guard = logging::init(&config.logging)?;
  let app = app::App::new(config)?;

  match args.command {
    Command::Install => {
      let report = app.install().await?;
      println!(
        "static {} | pages {}/{} | external {}/{}",
        report.static_cached,
        report.pages_cached,
        report.pages_total,
        report.external_cached,
        report.external_total
      );
    }
    Command::Fetch { url, html } => {
      let response = app.fetch(&url, html).await?;
      eprintln!("{} ({:?})", response.status, response.source);
      std::io::stdout().write_all(&response.body)?;
    }
    Command::Enqueue {
      kind,
      inputs,
      output,
    } => {
      let inputs = parse_json("inputs", &inputs)?;
      let output = parse_json("output", &output)?;
      let stored = app.enqueue(&kind, inputs, output)?;
      println!("queued prediction {}", stored.id);
    }
    Command::Flush => {
      let report = app.flush().await?;
      if report.skipped {
        println!("offline, nothing sent");
      } else {
        println!(
          "Synced {} predictions ({} failed)",
          report.delivered, report.failed
        );
      }
    }
    Command::Refresh => {
      for report in app.refresh().await? {
        println!(
          "{:<10} {:<8} {}",
          report.dataset.name(),
          format!("{:?}", report.source).to_lowercase(),
          report.records
        );
      }
    }
    Command::Status => {
      let status = app.status().await?;
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Command::Watch => app.watch().await?,
    Command::Recache { routes } => {
      let total = routes.len();
      let cached = app.recache(routes).await?;
      println!("re-cached {}/{} pages", cached, total);
    }
  }

  Ok(())
}

fn parse_json(what: &str, raw: &str) -> Result<serde_json::Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid {} JSON: {}", what, e))
}
