use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::connectivity::Signal;
use crate::net::{Fetch, Request};

/// Produces connectivity signals for the monitor.
pub trait SignalSource: Send {
  /// Receive the next signal; `None` once the source is exhausted.
  fn next(&mut self) -> impl Future<Output = Option<Signal>> + Send;
}

/// Signals pushed by hand.
#[cfg(test)]
pub struct ChannelSource {
  rx: mpsc::UnboundedReceiver<Signal>,
}

#[cfg(test)]
impl ChannelSource {
  pub fn channel() -> (mpsc::UnboundedSender<Signal>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }
}

#[cfg(test)]
impl SignalSource for ChannelSource {
  async fn next(&mut self) -> Option<Signal> {
    self.rx.recv().await
  }
}

/// Polls the origin and emits `Online`/`Offline` when reachability changes.
///
/// Signals can also be injected through [`ReachabilityProbe::injector`].
pub struct ReachabilityProbe {
  tx: mpsc::UnboundedSender<Signal>,
  rx: mpsc::UnboundedReceiver<Signal>,
}

impl ReachabilityProbe {
  /// Start probing `{origin}/api/cache-info` every `interval`, assuming
  /// `initially_reachable` until the first answer.
  pub fn spawn(
    fetcher: Arc<dyn Fetch>,
    origin: &Url,
    interval: Duration,
    initially_reachable: bool,
  ) -> Result<Self, url::ParseError> {
    let target = origin.join("/api/cache-info")?;
    let (tx, rx) = mpsc::unbounded_channel();
    let events = tx.clone();

    // Spawn poller
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      let mut reachable = initially_reachable;
      loop {
        ticker.tick().await;
        // The receiving end is gone.
        if events.is_closed() {
          break;
        }
        let now = probe(fetcher.as_ref(), &target).await;
        if now == reachable {
          continue;
        }
        reachable = now;
        let signal = if now { Signal::Online } else { Signal::Offline };
        if events.send(signal).is_err() {
          break;
        }
      }
    });

    Ok(Self { tx, rx })
  }

  pub fn injector(&self) -> mpsc::UnboundedSender<Signal> {
    self.tx.clone()
  }
}

impl SignalSource for ReachabilityProbe {
  async fn next(&mut self) -> Option<Signal> {
    self.rx.recv().await
  }
}

/// Whether the origin answers at all. Any status counts: a server that
/// responds is reachable.
pub async fn probe(fetcher: &dyn Fetch, target: &Url) -> bool {
  match fetcher.fetch(Request::get(target.clone())).await {
    Ok(response) => {
      debug!(url = %target, status = response.status, "probe answered");
      true
    }
    Err(e) => {
      debug!(url = %target, error = %e, "probe failed");
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockFetcher;

  #[tokio::test]
  async fn test_channel_source_ends_when_senders_drop() {
    let (tx, mut source) = ChannelSource::channel();
    tx.send(Signal::Offline).unwrap();
    drop(tx);
    assert_eq!(source.next().await, Some(Signal::Offline));
    assert_eq!(source.next().await, None);
  }

  #[tokio::test]
  async fn test_probe_emits_on_change_only() {
    let fetcher = MockFetcher::new();
    let origin = Url::parse("http://localhost:5000").unwrap();
    fetcher.set_offline(true);

    let mut probe =
      ReachabilityProbe::spawn(fetcher.clone(), &origin, Duration::from_millis(10), true).unwrap();
    assert_eq!(probe.next().await, Some(Signal::Offline));

    fetcher.set_offline(false);
    assert_eq!(probe.next().await, Some(Signal::Online));
    assert!(fetcher.call_count("http://localhost:5000/api/cache-info") >= 2);
  }

  #[tokio::test]
  async fn test_polling_stops_when_source_dropped() {
    let fetcher = MockFetcher::new();
    let origin = Url::parse("http://localhost:5000").unwrap();
    let target = "http://localhost:5000/api/cache-info";
    let source =
      ReachabilityProbe::spawn(fetcher.clone(), &origin, Duration::from_millis(5), true).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(fetcher.call_count(target) >= 1);
    drop(source);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let after_drop = fetcher.call_count(target);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fetcher.call_count(target), after_drop);
  }

  #[tokio::test]
  async fn test_injected_signals_are_delivered() {
    let fetcher = MockFetcher::new();
    let origin = Url::parse("http://localhost:5000").unwrap();
    let mut probe =
      ReachabilityProbe::spawn(fetcher, &origin, Duration::from_secs(60), true).unwrap();

    probe.injector().send(Signal::CapabilityRequested).unwrap();
    assert_eq!(probe.next().await, Some(Signal::CapabilityRequested));
  }

  #[tokio::test]
  async fn test_any_status_counts_as_reachable() {
    let fetcher = MockFetcher::new();
    let target = Url::parse("http://localhost:5000/api/cache-info").unwrap();
    // Unknown routes answer 404.
    assert!(probe(fetcher.as_ref(), &target).await);
    fetcher.set_offline(true);
    assert!(!probe(fetcher.as_ref(), &target).await);
  }
}
