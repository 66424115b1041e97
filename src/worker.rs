//! Background scheduling loop for the dispatcher.
//!
//! Owned by the process lifecycle: spawned at server start, signaled through
//! a watch channel at shutdown, and joined before exit. Dispatch errors are
//! logged and the loop keeps going; only the shutdown signal ends it.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;

/// Run dispatch cycles every `interval` until `shutdown` flips to true.
pub async fn run(dispatcher: Dispatcher, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "Dispatch worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = dispatcher.dispatch_pending().await {
            if *shutdown.borrow() {
                break;
            }
            warn!(error = %e, "Dispatch cycle failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("Dispatch worker stopped");
}
