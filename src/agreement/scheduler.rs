//! Agreement scheduler
//!
//! Watches the wall clock and starts the next cycle's passive phase when
//! the configured start condition is met. All nodes evaluate the clock in
//! the same fixed reference zone (CET, modeled as UTC+1 without daylight
//! saving), so geographically distributed nodes agree on "now".

use crate::agreement::coordinator::AgreementCoordinator;
use chrono::{FixedOffset, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const REFERENCE_ZONE_SECONDS: i32 = 3600;

/// Handle to the background task that waits for the next start time.
/// The task fires at most once and then terminates; an operator-forced
/// start cancels it via [`AgreementScheduler::cancel`].
pub struct AgreementScheduler {
    canceled: Arc<AtomicBool>,
}

impl AgreementScheduler {
    /// Spawns the polling task. Must be called within a Tokio runtime.
    pub fn start(
        coordinator: Arc<AgreementCoordinator>,
        poll_interval: Duration,
        divisor: u32,
    ) -> Self {
        let canceled = Arc::new(AtomicBool::new(false));
        let flag = canceled.clone();
        tokio::spawn(async move {
            loop {
                if flag.load(Ordering::Relaxed) {
                    debug!("scheduler canceled before firing");
                    return;
                }
                if time_for_agreement(divisor) {
                    info!("start condition met, entering passive phase");
                    coordinator.start_passive_phase();
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
        });
        AgreementScheduler { canceled }
    }

    /// Cooperatively cancels the task before it fires.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }
}

/// True when the current reference-zone minute is aligned to the divisor.
pub fn time_for_agreement(divisor: u32) -> bool {
    let zone = FixedOffset::east_opt(REFERENCE_ZONE_SECONDS).expect("reference zone offset");
    let now = Utc::now().with_timezone(&zone);
    minute_matches(now.minute(), divisor)
}

fn minute_matches(minute: u32, divisor: u32) -> bool {
    divisor != 0 && minute % divisor == 0
}
