// =============================================================================
// Fan-out Loop — fixed-cadence quote driver
// =============================================================================
//
// Every tick (1 s by default): take the union of subscribed codes, fetch them
// in chunks through the quote source, and queue each quote to every
// subscriber's writer mailbox. The loop never awaits per-user work — a
// session that cannot keep up has its quotes dropped for the cycle and the
// next tick brings fresh values. Codes that failed upstream are dropped
// silently for the tick.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::rules::DataPoint;

/// Run the fan-out loop until shutdown is signalled.
pub async fn run_fanout(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    info!(
        interval_ms = state.config.fanout_interval_ms,
        batch_size = state.config.batch_size,
        test_mode = state.config.test_mode,
        "fan-out loop started"
    );

    let mut ticker = interval(state.config.fanout_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("fan-out loop stopping");
                return;
            }
        }
        fanout_tick(&state).await;
    }
}

/// One iteration of the driver. Factored out of the loop for tests.
pub async fn fanout_tick(state: &Arc<AppState>) {
    let codes = state.index.all_subscribed_codes();
    if codes.is_empty() {
        return;
    }

    let outcome = state.source.fetch_batch(&codes).await;
    state.fanout_ticks.fetch_add(1, Ordering::Relaxed);

    if !outcome.failed.is_empty() {
        debug!(failed = ?outcome.failed, "codes dropped this tick");
    }

    for (code, quote) in &outcome.quotes {
        state.intraday.record(
            code,
            DataPoint {
                timestamp: quote.timestamp,
                price: quote.current_price,
                volume: quote.volume,
                change_percent: quote.change_percent,
            },
        );

        for user in state.index.subscribers_of(code) {
            if !state.registry.send_quote(&user, quote.clone()) {
                debug!(user_id = %user, ts_code = %code, "quote dropped (session gone or slow)");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
