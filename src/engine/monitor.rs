use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::ExecutionEngine;
use crate::events::EngineEvent;

/// One long-lived task per open position: re-price on an interval, feed
/// the mark through the threshold checks, halt and reduce on a breach.
/// Poll failures are logged and retried next tick; nothing thrown here
/// ever escapes the task.
pub(crate) fn spawn(
    engine: ExecutionEngine,
    instrument: String,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(engine.config().mark_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::debug!(instrument = %instrument, "position monitor started");

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    tracing::debug!(instrument = %instrument, "position monitor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            // Position may have closed between ticks
            if engine.get_position(&instrument).is_none() {
                tracing::debug!(instrument = %instrument, "position closed, monitor exiting");
                return;
            }

            let price = match engine.port_price(&instrument).await {
                Ok(price) => price,
                Err(e) => {
                    // Transient venue blips must not kill a long-lived
                    // monitor; surface and try again next tick
                    tracing::warn!(instrument = %instrument, error = %e, "mark poll failed");
                    engine.emit(EngineEvent::MonitorError {
                        scope: format!("position:{}", instrument),
                        message: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    continue;
                }
            };

            if engine.mark_and_enforce(&instrument, price).await.is_none() {
                return;
            }
        }
    })
}
