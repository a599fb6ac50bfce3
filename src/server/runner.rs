//! Background materializer for recurring plans and goal plans.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{with_db, AppState};
use crate::{goal_plans, recurring, session};

const SESSION_MAX_IDLE_DAYS: i64 = 30;

/// What one tick produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub occurrences: usize,
    pub plan_runs: usize,
    pub sessions_purged: usize,
}

/// Start the periodic runner. `None` when the interval is 0.
pub fn spawn(state: AppState) -> Option<JoinHandle<()>> {
    let secs = state.settings.recurring_interval_secs;
    if secs == 0 {
        info!("background runner disabled");
        return None;
    }
    info!(interval_secs = secs, "background runner started");
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(secs));
        loop {
            ticker.tick().await;
            tick(&state).await;
        }
    }))
}

pub async fn tick(state: &AppState) -> Option<TickReport> {
    let result = with_db(state, |conn| {
        let now = chrono::Utc::now().naive_utc();
        let occurrences = recurring::process_all(conn, now)?
            .iter()
            .map(|(_, created)| created.len())
            .sum();

        let mut plan_runs = 0;
        for user_id in goal_plans::users_with_active_plans(conn)? {
            match goal_plans::run_plans(conn, user_id, now) {
                Ok(runs) => plan_runs += runs.len(),
                Err(e) => warn!(user_id, error = %e, "goal plan run failed"),
            }
        }
        let sessions_purged = session::purge_stale(conn, SESSION_MAX_IDLE_DAYS)?;
        Ok(TickReport {
            occurrences,
            plan_runs,
            sessions_purged,
        })
    })
    .await;

    match result {
        Ok(report) => {
            if report != TickReport::default() {
                info!(
                    occurrences = report.occurrences,
                    plan_runs = report.plan_runs,
                    sessions_purged = report.sessions_purged,
                    "runner tick"
                );
            }
            Some(report)
        }
        Err(e) => {
            error!(error = %e, "runner tick failed");
            None
        }
    }
}

/// One-off recurring run for a user who just logged in.
pub fn schedule_user(state: AppState, user_id: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = with_db(&state, move |conn| {
            recurring::process_for_user(conn, user_id, chrono::Utc::now().naive_utc())
        })
        .await;
        if let Err(e) = result {
            warn!(user_id, error = %e, "login recurring run failed");
        }
    })
}
