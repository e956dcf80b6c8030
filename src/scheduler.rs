//! The two daily background jobs, fired at 00:00 UTC.
//!
//! State decay walks every non-empty inventory product one day forward;
//! weekly re-estimation visits each product on the weekday it was first
//! logged. The loops sleep until the next UTC midnight; on an error they
//! back off for an hour and retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use tracing::{error, info};

use crate::predictor::service::PredictorService;

const ERROR_BACKOFF: Duration = Duration::from_secs(3600);

/// Time to sleep from `now` until the next 00:00 UTC.
pub fn duration_until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(now + chrono::Duration::days(1));
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

pub async fn daily_state_decay_polling(service: Arc<PredictorService>) -> Result<()> {
    info!("🌙 Starting daily state decay job (00:00 UTC)");
    loop {
        let wait = duration_until_next_utc_midnight(service.now());
        tokio::time::sleep(wait).await;

        match service.run_state_decay() {
            Ok(updated) => {
                info!("🌙 Daily state decay done: {} products", updated);
            }
            Err(e) => {
                error!("daily state decay failed: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

pub async fn weekly_reestimation_polling(service: Arc<PredictorService>) -> Result<()> {
    info!("📅 Starting weekly re-estimation job (00:00 UTC)");
    loop {
        let wait = duration_until_next_utc_midnight(service.now());
        tokio::time::sleep(wait).await;

        match service.run_weekly_reestimation() {
            Ok(matched) => {
                info!("📅 Weekly re-estimation done: {} products due", matched);
            }
            Err(e) => {
                error!("weekly re-estimation failed: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}
