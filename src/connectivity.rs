//! Online/offline tracking.
//!
//! The monitor is the single source of truth for "are we online". Something
//! outside it feeds transitions in: the platform's connectivity signal, or for
//! a native process the reachability probe in this module.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::remote::RemoteEndpoint;

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared connectivity flag; cloning shares the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _rx) = watch::channel(initially_online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record an observation. Returns true if it was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  /// A receiver that wakes on every transition.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Call `callback` with the new state after every transition.
  ///
  /// The task ends when every handle to this monitor has been dropped, or when
  /// the returned handle is aborted.
  pub fn on_change<F>(&self, mut callback: F) -> JoinHandle<()>
  where
    F: FnMut(bool) + Send + 'static,
  {
    let mut rx = self.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        callback(online);
      }
    })
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Periodically check that the remote endpoint answers and feed the result to `monitor`.
///
/// A refusal (for example an expired session) still proves the endpoint is
/// reachable, so only transient failures count as offline.
pub fn spawn_probe<R: RemoteEndpoint>(
  monitor: ConnectivityMonitor,
  remote: Arc<R>,
  interval: Duration,
) -> JoinHandle<()> {
  let interval = if interval.is_zero() {
    warn!("probe interval is zero, using {}s", DEFAULT_PROBE_INTERVAL.as_secs());
    DEFAULT_PROBE_INTERVAL
  } else {
    interval
  };

  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let online = match remote.health().await {
        Ok(()) => true,
        Err(e) => {
          debug!(error = %e, "reachability probe failed");
          !e.is_transient()
        }
      };
      monitor.set_online(online);
    }
  })
}
