use std::time::Duration;

use futures_util::{stream, Stream};
use log::debug;
use tokio::{
  sync::{mpsc, watch},
  time::MissedTickBehavior,
};

/// Requests a full sync. At most one request is queued at a time.
#[derive(Clone)]
pub struct Resync {
  tx: mpsc::Sender<()>,
}

impl Resync {
  /// Returns the handle and the stream of queued syncs, which ends once every
  /// handle is dropped and the queue is drained
  pub fn channel() -> (Resync, impl Stream<Item = ()> + Send + Sync + 'static) {
    let (tx, rx) = mpsc::channel(1);
    let requests = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|()| ((), rx)) });
    (Resync { tx }, requests)
  }

  /// `false` when a sync is already queued or nobody listens anymore
  pub fn request(&self) -> bool {
    self.tx.try_send(()).is_ok()
  }

  /// Requests a sync every `period` until `stop` flips to `true` or its sender
  /// goes away
  pub async fn run(self, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick is immediate and controllers list everything on start anyway
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if !self.request() {
            debug!("Sync already queued, dropping tick");
          }
        }
        changed = stop.changed() => {
          if changed.is_err() || *stop.borrow() {
            break;
          }
        }
      }
    }
    debug!("Resync ticker stopped");
  }
}
