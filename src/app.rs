use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use url::Url;

use crate::cache::{
  CacheLifecycle, Classifier, ControlMessage, GenerationState, InstallReport, SqliteCacheStorage,
};
use crate::config::Config;
use crate::connectivity::{CapabilityState, ConnectivityMonitor, FixedCapability, LogSink, Signal};
use crate::datasets::{DatasetReport, DatasetSync};
use crate::db::{Collection, Store, StoreLocation, Stored};
use crate::event::{self, ReachabilityProbe};
use crate::net::{Fetch, HttpFetcher, Request, Response};
use crate::status::OfflineStatus;
use crate::sync::{FlushReport, HttpDelivery, PendingOutput, SyncQueue};

/// Wiring of the store, the cache and the sync machinery for one process.
pub struct App {
  config: Config,
  origin: Url,
  store: Arc<Store>,
  fetcher: Arc<dyn Fetch>,
  lifecycle: Arc<CacheLifecycle<SqliteCacheStorage>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let origin = config.origin_url()?;
    let path = config.database_path()?;

    let store = Store::new(StoreLocation::File(path.clone()));
    store.open()?;
    store.ensure_schema(config.schema_version, Collection::ALL)?;

    // The cache keeps its own connection to the same file.
    let storage = Arc::new(SqliteCacheStorage::open(&path)?);
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(config.fetch_timeout())?);
    let lifecycle = Arc::new(CacheLifecycle::new(
      storage,
      Arc::clone(&fetcher),
      config.generation()?,
      origin.clone(),
      config.manifest(),
    ));

    Ok(Self {
      config,
      origin,
      store: Arc::new(store),
      fetcher,
      lifecycle,
    })
  }

  /// Provision the current generation and take over from older ones.
  pub async fn install(&self) -> Result<InstallReport> {
    let report = self.lifecycle.install().await?;
    let purged = self.lifecycle.activate()?;
    if !purged.is_empty() {
      info!(purged = ?purged, "old caches removed");
    }
    Ok(report)
  }

  /// Fetch `url` through the cache tiers.
  pub async fn fetch(&self, url: &str, html: bool) -> Result<Response> {
    self.ready().await?;
    let url = self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL {:?}: {}", url, e))?;
    let request = if html {
      Request::navigate(url)
    } else {
      Request::get(url)
    };

    let tiers = self.lifecycle.tier_manager(Classifier::new(
      &self.origin,
      &self.config.allowed_hosts(),
    ))?;
    let response = match tiers.handle(request.clone()).await {
      Some(response) => response,
      None => self.fetcher.fetch(request).await?,
    };
    // Let background cache writes land before the process exits.
    tiers.settle().await;
    Ok(response)
  }

  pub fn enqueue(
    &self,
    kind: &str,
    inputs: serde_json::Value,
    output: serde_json::Value,
  ) -> Result<Stored<PendingOutput>> {
    let monitor = self.monitor(false);
    Ok(self.queue(&monitor)?.enqueue(kind, inputs, output)?)
  }

  /// Deliver pending outputs if the origin is reachable.
  pub async fn flush(&self) -> Result<FlushReport> {
    let monitor = self.monitor(self.reachable().await);
    Ok(self.queue(&monitor)?.flush().await?)
  }

  pub async fn refresh(&self) -> Result<Vec<DatasetReport>> {
    let sync = DatasetSync::new(
      Arc::clone(&self.store),
      Arc::clone(&self.fetcher),
      self.origin.clone(),
    );
    Ok(sync.refresh_all(&self.config.dataset_collections()?).await?)
  }

  pub async fn status(&self) -> Result<OfflineStatus> {
    let mut monitor = self.monitor(self.reachable().await);
    monitor.start().await;
    let queue = self.queue(&monitor)?;
    Ok(OfflineStatus::collect(&self.store, &queue, &monitor.snapshot())?)
  }

  /// Re-cache `routes` into the pages tier of the current generation.
  pub async fn recache(&self, routes: Vec<String>) -> Result<usize> {
    self.ready().await?;
    Ok(self.lifecycle.recache_pages(&routes).await)
  }

  /// Follow connectivity until interrupted, flushing on every reconnect.
  ///
  /// Lines on stdin: `location` re-requests the location grant,
  /// `recache <route>...` re-caches pages, `status` prints the status.
  pub async fn watch(&self) -> Result<()> {
    let control = self.lifecycle.spawn_control();
    if self.lifecycle.resume()? {
      let _ = control.send(ControlMessage::SkipWaiting);
    } else {
      match self.lifecycle.install().await {
        Ok(_) => {
          let _ = control.send(ControlMessage::SkipWaiting);
        }
        Err(e) => warn!(error = %e, "continuing without an offline cache"),
      }
    }

    let online = self.reachable().await;
    let monitor = self.monitor(online);
    let status = monitor.subscribe();
    let queue = Arc::new(self.queue(&monitor)?);
    let mut monitor = monitor.with_replay(queue.clone());
    monitor.start().await;
    if online {
      queue.flush().await?;
    }

    let probe = ReachabilityProbe::spawn(
      Arc::clone(&self.fetcher),
      &self.origin,
      self.config.probe_interval(),
      online,
    )?;
    let commands = Commands {
      signals: probe.injector(),
      control,
      store: Arc::clone(&self.store),
      queue: Arc::clone(&queue),
      status,
    };
    tokio::spawn(commands.run());

    info!(origin = %self.origin, "watching connectivity, Ctrl-C to stop");
    tokio::select! {
      _ = monitor.run(probe) => {}
      _ = tokio::signal::ctrl_c() => info!("stopping"),
    }
    monitor.settle().await;

    if self.lifecycle.refresh_state()? == GenerationState::Superseded {
      warn!("a newer cache generation took over while running");
    }
    Ok(())
  }

  /// Resume or install the current generation, then activate it.
  async fn ready(&self) -> Result<()> {
    if !self.lifecycle.resume()? {
      self.lifecycle.install().await?;
    }
    self.lifecycle.activate()?;
    Ok(())
  }

  async fn reachable(&self) -> bool {
    match self.origin.join("/api/cache-info") {
      Ok(target) => event::probe(self.fetcher.as_ref(), &target).await,
      Err(_) => false,
    }
  }

  fn monitor(&self, online: bool) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
      online,
      Arc::new(FixedCapability::new(self.config.location_granted)),
      Arc::new(LogSink),
      self.config.capability_timeout(),
    )
  }

  fn queue(&self, monitor: &ConnectivityMonitor) -> Result<SyncQueue> {
    let delivery = HttpDelivery::new(Arc::clone(&self.fetcher), &self.origin)?;
    Ok(SyncQueue::new(
      Arc::clone(&self.store),
      Arc::new(delivery),
      monitor.subscribe(),
    ))
  }
}

/// Interactive commands read from stdin while watching.
struct Commands {
  signals: mpsc::UnboundedSender<Signal>,
  control: mpsc::UnboundedSender<ControlMessage>,
  store: Arc<Store>,
  queue: Arc<SyncQueue>,
  status: watch::Receiver<CapabilityState>,
}

impl Commands {
  async fn run(self) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      let mut words = line.split_whitespace();
      let sent = match words.next() {
        Some("location") => self.signals.send(Signal::CapabilityRequested).is_ok(),
        Some("recache") => {
          let routes = words.map(String::from).collect();
          self.control.send(ControlMessage::CachePages(routes)).is_ok()
        }
        Some("status") => {
          let state = *self.status.borrow();
          match OfflineStatus::collect(&self.store, &self.queue, &state) {
            Ok(status) => match serde_json::to_string_pretty(&status) {
              Ok(json) => println!("{}", json),
              Err(e) => warn!(error = %e, "could not render status"),
            },
            Err(e) => warn!(error = %e, "could not read status"),
          }
          true
        }
        Some(other) => {
          warn!(command = other, "unknown command");
          true
        }
        None => true,
      };
      if !sent {
        break;
      }
    }
  }
}
