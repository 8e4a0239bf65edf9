//! Connectivity and location-capability state machine.
//!
//! The monitor is the only writer of [`CapabilityState`]. Everyone else reads
//! snapshots through a `watch` subscription.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::OfflineError;
use crate::event::SignalSource;
use crate::net::BoxFuture;

/// Network reachability and location grant, as last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityState {
  pub network_reachable: bool,
  pub location_granted: bool,
  /// Whether a grant has ever been resolved in this process
  pub location_checked: bool,
}

impl CapabilityState {
  /// Live sections need both a network and a location grant.
  pub fn live_data_allowed(&self) -> bool {
    self.network_reachable && self.location_granted
  }

  pub fn capability(&self) -> Capability {
    match (self.location_checked, self.location_granted) {
      (false, _) => Capability::Unresolved,
      (true, true) => Capability::Granted,
      (true, false) => Capability::Denied,
    }
  }

  pub fn badges(&self) -> Badges {
    let connection = if self.network_reachable {
      ConnectionBadge::Online
    } else {
      ConnectionBadge::Offline
    };
    let live = match (self.network_reachable, self.location_granted) {
      (false, _) => LiveBadge::Offline,
      (true, true) => LiveBadge::Live,
      (true, false) => LiveBadge::LocationOff,
    };
    Badges { connection, live }
  }
}

/// Location grant as resolved so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
  Unresolved,
  Granted,
  Denied,
}

/// Raw network indicator. Never influenced by the location grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionBadge {
  Online,
  Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiveBadge {
  Live,
  LocationOff,
  Offline,
}

/// What the UI shows for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Badges {
  pub connection: ConnectionBadge,
  pub live: LiveBadge,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
  Online,
  Offline,
  /// The user asked to enable location
  CapabilityRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
  /// Resolved once at startup or on the first reconnect
  Automatic,
  /// Explicit user request; may repeat
  Manual,
}

/// Source of the location grant. `Err` means denied.
pub trait CapabilityProvider: Send + Sync {
  fn request(&self, mode: ResolveMode) -> BoxFuture<Result<(), OfflineError>>;
}

/// A grant decided up front, for hosts without an interactive permission API.
pub struct FixedCapability {
  granted: bool,
}

impl FixedCapability {
  pub fn new(granted: bool) -> Self {
    Self { granted }
  }
}

impl CapabilityProvider for FixedCapability {
  fn request(&self, _mode: ResolveMode) -> BoxFuture<Result<(), OfflineError>> {
    let granted = self.granted;
    Box::pin(async move {
      if granted {
        Ok(())
      } else {
        Err(OfflineError::CapabilityDenied)
      }
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
  Success,
  Info,
  Error,
}

/// UI collaborators that react to state changes.
pub trait StatusSink: Send + Sync {
  /// Reveal or hide live sections for the new state.
  fn live_data_changed(&self, state: &CapabilityState);
  /// The network went away; switch to degraded mode.
  fn degraded(&self);
  /// Explain why location is needed and offer to enable it.
  fn capability_prompt(&self);
  fn notify(&self, notice: Notice, message: &str);
}

/// Writes every status change to the log.
pub struct LogSink;

impl StatusSink for LogSink {
  fn live_data_changed(&self, state: &CapabilityState) {
    if state.live_data_allowed() {
      info!("live sections enabled");
    } else if state.network_reachable {
      info!("live sections hidden, location required");
    } else {
      info!("live sections hidden, offline");
    }
  }

  fn degraded(&self) {
    info!("degraded mode, using cached data");
  }

  fn capability_prompt(&self) {
    info!("location access is needed for live weather and market prices");
  }

  fn notify(&self, notice: Notice, message: &str) {
    match notice {
      Notice::Success | Notice::Info => info!("{}", message),
      Notice::Error => error!("{}", message),
    }
  }
}

/// Work to run when connectivity comes back.
pub trait Replay: Send + Sync {
  fn replay(self: Arc<Self>) -> BoxFuture<()>;
}

/// Owns the capability state and drives its transitions.
pub struct ConnectivityMonitor {
  state: watch::Sender<CapabilityState>,
  provider: Arc<dyn CapabilityProvider>,
  sink: Arc<dyn StatusSink>,
  replay: Option<Arc<dyn Replay>>,
  capability_timeout: Duration,
  prompted: bool,
  tasks: TaskTracker,
}

impl ConnectivityMonitor {
  pub fn new(
    network_reachable: bool,
    provider: Arc<dyn CapabilityProvider>,
    sink: Arc<dyn StatusSink>,
    capability_timeout: Duration,
  ) -> Self {
    let (state, _) = watch::channel(CapabilityState {
      network_reachable,
      ..CapabilityState::default()
    });
    Self {
      state,
      provider,
      sink,
      replay: None,
      capability_timeout,
      prompted: false,
      tasks: TaskTracker::new(),
    }
  }

  /// Run `replay` on every transition to reachable.
  pub fn with_replay(mut self, replay: Arc<dyn Replay>) -> Self {
    self.replay = Some(replay);
    self
  }

  pub fn subscribe(&self) -> watch::Receiver<CapabilityState> {
    self.state.subscribe()
  }

  pub fn snapshot(&self) -> CapabilityState {
    *self.state.borrow()
  }

  /// Resolve the grant automatically and publish the initial state.
  pub async fn start(&mut self) {
    let mut next = self.snapshot();
    self.resolve(&mut next, ResolveMode::Automatic).await;
    self.publish(next);
  }

  pub async fn handle(&mut self, signal: Signal) {
    let mut next = self.snapshot();
    match signal {
      Signal::Online => {
        if next.network_reachable {
          return;
        }
        next.network_reachable = true;
        self.sink.notify(Notice::Success, "You are back online!");
        if !next.location_checked {
          self.resolve(&mut next, ResolveMode::Automatic).await;
        }
        self.publish(next);
        self.spawn_replay();
      }
      Signal::Offline => {
        if !next.network_reachable {
          return;
        }
        next.network_reachable = false;
        self.publish(next);
        self.sink.notify(Notice::Info, "Working in offline mode");
        self.sink.degraded();
      }
      Signal::CapabilityRequested => {
        self.resolve(&mut next, ResolveMode::Manual).await;
        if next.location_granted {
          self
            .sink
            .notify(Notice::Success, "Location enabled! Live features activated.");
        } else {
          self
            .sink
            .notify(Notice::Error, "Location permission denied. Live features disabled.");
        }
        self.publish(next);
      }
    }
  }

  /// Consume signals until the source ends.
  pub async fn run<E: SignalSource>(&mut self, mut source: E) {
    while let Some(signal) = source.next().await {
      debug!(?signal, "connectivity signal");
      self.handle(signal).await;
    }
  }

  /// Wait for every replay started so far.
  pub async fn settle(&self) {
    self.tasks.close();
    self.tasks.wait().await;
    self.tasks.reopen();
  }

  async fn resolve(&mut self, next: &mut CapabilityState, mode: ResolveMode) {
    if mode == ResolveMode::Automatic && next.location_checked {
      return;
    }

    let granted = match tokio::time::timeout(self.capability_timeout, self.provider.request(mode)).await
    {
      Ok(Ok(())) => true,
      Ok(Err(e)) => {
        debug!(error = %e, "location not granted");
        false
      }
      Err(_) => {
        warn!(timeout = ?self.capability_timeout, "location request timed out");
        false
      }
    };
    next.location_checked = true;
    next.location_granted = granted;

    if !granted && mode == ResolveMode::Automatic && !self.prompted {
      self.prompted = true;
      self.sink.capability_prompt();
    }
  }

  fn publish(&self, next: CapabilityState) {
    self.state.send_replace(next);
    debug!(
      online = next.network_reachable,
      live = next.live_data_allowed(),
      "capability state published"
    );
    self.sink.live_data_changed(&next);
  }

  fn spawn_replay(&self) {
    if let Some(replay) = &self.replay {
      self.tasks.spawn(Arc::clone(replay).replay());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::{Collection, Store, StoreLocation};
  use crate::event::ChannelSource;
  use crate::net::mock::MockFetcher;
  use crate::sync::{HttpDelivery, SyncQueue};
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use url::Url;

  #[derive(Default)]
  struct RecordingSink {
    events: Mutex<Vec<String>>,
  }

  impl RecordingSink {
    fn events(&self) -> Vec<String> {
      self.events.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
      self.events().iter().filter(|e| e.as_str() == event).count()
    }
  }

  impl StatusSink for RecordingSink {
    fn live_data_changed(&self, state: &CapabilityState) {
      let event = if state.live_data_allowed() { "reveal" } else { "hide" };
      self.events.lock().unwrap().push(event.into());
    }

    fn degraded(&self) {
      self.events.lock().unwrap().push("degraded".into());
    }

    fn capability_prompt(&self) {
      self.events.lock().unwrap().push("prompt".into());
    }

    fn notify(&self, notice: Notice, message: &str) {
      self
        .events
        .lock()
        .unwrap()
        .push(format!("{:?}: {}", notice, message));
    }
  }

  /// Answers with queued grants, denying once the queue is empty.
  #[derive(Default)]
  struct ScriptedProvider {
    answers: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
  }

  impl ScriptedProvider {
    fn answering(answers: &[bool]) -> Arc<Self> {
      Arc::new(Self {
        answers: Mutex::new(answers.iter().copied().collect()),
        ..Self::default()
      })
    }
  }

  impl CapabilityProvider for ScriptedProvider {
    fn request(&self, _mode: ResolveMode) -> BoxFuture<Result<(), OfflineError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let granted = self.answers.lock().unwrap().pop_front().unwrap_or(false);
      let delay = self.delay;
      Box::pin(async move {
        if let Some(delay) = delay {
          tokio::time::sleep(delay).await;
        }
        if granted {
          Ok(())
        } else {
          Err(OfflineError::CapabilityDenied)
        }
      })
    }
  }

  fn monitor(
    online: bool,
    provider: Arc<ScriptedProvider>,
    sink: Arc<RecordingSink>,
  ) -> ConnectivityMonitor {
    ConnectivityMonitor::new(online, provider, sink, Duration::from_secs(1))
  }

  #[test]
  fn test_live_data_lattice() {
    for network_reachable in [false, true] {
      for location_granted in [false, true] {
        for location_checked in [false, true] {
          let state = CapabilityState {
            network_reachable,
            location_granted,
            location_checked,
          };
          assert_eq!(
            state.live_data_allowed(),
            network_reachable && location_granted,
            "{:?}",
            state
          );
          let expected = if network_reachable {
            ConnectionBadge::Online
          } else {
            ConnectionBadge::Offline
          };
          assert_eq!(state.badges().connection, expected);
        }
      }
    }
  }

  #[test]
  fn test_badges() {
    let live = CapabilityState {
      network_reachable: true,
      location_granted: true,
      location_checked: true,
    };
    assert_eq!(live.badges().live, LiveBadge::Live);
    let no_location = CapabilityState {
      location_granted: false,
      ..live
    };
    assert_eq!(no_location.badges().live, LiveBadge::LocationOff);
    let offline = CapabilityState {
      network_reachable: false,
      ..live
    };
    assert_eq!(offline.badges().live, LiveBadge::Offline);
    assert_eq!(offline.badges().connection, ConnectionBadge::Offline);
  }

  #[tokio::test]
  async fn test_start_resolves_and_publishes() {
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = monitor(true, ScriptedProvider::answering(&[true]), sink.clone());
    let rx = monitor.subscribe();
    assert_eq!(rx.borrow().capability(), Capability::Unresolved);

    monitor.start().await;
    assert!(rx.borrow().live_data_allowed());
    assert_eq!(rx.borrow().capability(), Capability::Granted);
    assert_eq!(sink.events(), vec!["reveal"]);
  }

  #[tokio::test]
  async fn test_network_drop_forces_live_data_off() {
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = monitor(true, ScriptedProvider::answering(&[true]), sink.clone());
    monitor.start().await;

    monitor.handle(Signal::Offline).await;
    let state = monitor.snapshot();
    assert!(!state.live_data_allowed());
    // The grant itself survives.
    assert!(state.location_granted);
    assert_eq!(sink.count("degraded"), 1);
    assert_eq!(sink.count("Info: Working in offline mode"), 1);

    // Repeated signals are not transitions.
    monitor.handle(Signal::Offline).await;
    assert_eq!(sink.count("degraded"), 1);

    monitor.handle(Signal::Online).await;
    assert!(monitor.snapshot().live_data_allowed());
  }

  #[tokio::test]
  async fn test_automatic_denial_prompts_exactly_once() {
    let sink = Arc::new(RecordingSink::default());
    let provider = ScriptedProvider::answering(&[false]);
    let mut monitor = monitor(true, provider.clone(), sink.clone());

    monitor.start().await;
    monitor.handle(Signal::Offline).await;
    monitor.handle(Signal::Online).await;
    monitor.start().await;

    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.count("prompt"), 1);
    assert_eq!(monitor.snapshot().capability(), Capability::Denied);
  }

  #[tokio::test]
  async fn test_manual_request_can_repeat() {
    let sink = Arc::new(RecordingSink::default());
    let provider = ScriptedProvider::answering(&[false, false, true]);
    let mut monitor = monitor(true, provider.clone(), sink.clone());
    monitor.start().await;

    monitor.handle(Signal::CapabilityRequested).await;
    assert!(!monitor.snapshot().live_data_allowed());
    assert_eq!(
      sink.count("Error: Location permission denied. Live features disabled."),
      1
    );

    monitor.handle(Signal::CapabilityRequested).await;
    assert!(monitor.snapshot().live_data_allowed());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    // Only the automatic resolution prompts.
    assert_eq!(sink.count("prompt"), 1);
  }

  #[tokio::test]
  async fn test_capability_never_moves_network_indicator() {
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = monitor(false, ScriptedProvider::answering(&[true, true]), sink);
    monitor.start().await;
    monitor.handle(Signal::CapabilityRequested).await;

    let state = monitor.snapshot();
    assert!(state.location_granted);
    assert!(!state.network_reachable);
    assert_eq!(state.badges().connection, ConnectionBadge::Offline);
    assert!(!state.live_data_allowed());
  }

  #[tokio::test]
  async fn test_capability_timeout_is_denial() {
    let sink = Arc::new(RecordingSink::default());
    let provider = Arc::new(ScriptedProvider {
      answers: Mutex::new(VecDeque::from([true])),
      delay: Some(Duration::from_millis(500)),
      ..ScriptedProvider::default()
    });
    let mut monitor = ConnectivityMonitor::new(true, provider, sink.clone(), Duration::from_millis(20));

    monitor.start().await;
    assert_eq!(monitor.snapshot().capability(), Capability::Denied);
    assert_eq!(sink.count("prompt"), 1);
  }

  #[tokio::test]
  async fn test_reconnect_resolves_unresolved_capability() {
    let sink = Arc::new(RecordingSink::default());
    let provider = ScriptedProvider::answering(&[true]);
    let mut monitor = monitor(false, provider.clone(), sink.clone());

    monitor.handle(Signal::Online).await;
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert!(monitor.snapshot().live_data_allowed());
    assert_eq!(sink.count("Success: You are back online!"), 1);
    assert_eq!(sink.events().last().map(String::as_str), Some("reveal"));
  }

  #[tokio::test]
  async fn test_reconnect_flushes_pending_outputs() {
    let store = Store::new(StoreLocation::Memory);
    store.open().unwrap();
    store.ensure_schema(1, Collection::ALL).unwrap();
    let store = Arc::new(store);

    let fetcher = MockFetcher::new();
    fetcher.respond(
      "http://localhost:5000/api/sync-prediction",
      200,
      "application/json",
      "{}",
    );
    let origin = Url::parse("http://localhost:5000").unwrap();
    let delivery = Arc::new(HttpDelivery::new(fetcher.clone(), &origin).unwrap());

    let sink = Arc::new(RecordingSink::default());
    let monitor = monitor(false, ScriptedProvider::answering(&[]), sink);
    let queue = Arc::new(SyncQueue::new(store, delivery, monitor.subscribe()));
    let mut monitor = monitor.with_replay(queue.clone());
    monitor.start().await;

    queue
      .enqueue("disease", json!({"pH": 6.5}), json!({"risk_level": "MEDIUM"}))
      .unwrap();
    assert_eq!(queue.pending().unwrap().len(), 1);

    let (tx, source) = ChannelSource::channel();
    tx.send(Signal::Online).unwrap();
    drop(tx);
    monitor.run(source).await;
    monitor.settle().await;

    assert!(queue.pending().unwrap().is_empty());
    assert_eq!(
      fetcher.call_count("http://localhost:5000/api/sync-prediction"),
      1
    );
  }
}
