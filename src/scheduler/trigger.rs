//! Scheduling triggers: fixed interval or 5-field cron (UTC).

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::models::Monitor;

/// When a monitor's job fires. Cron wins over interval when both are set.
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron {
        schedule: Box<cron::Schedule>,
        /// The operator-facing 5-field expression, kept for persistence.
        expr: String,
    },
}

impl Trigger {
    pub fn from_monitor(monitor: &Monitor) -> Result<Trigger, String> {
        if let Some(expr) = &monitor.schedule {
            let schedule = Self::parse_cron(expr)?;
            return Ok(Trigger::Cron {
                schedule: Box::new(schedule),
                expr: expr.clone(),
            });
        }
        Ok(Trigger::Interval(Duration::from_secs(
            u64::from(monitor.interval),
        )))
    }

    /// Parse a standard 5-field cron expression
    /// (`minute hour day-of-month month day-of-week`).
    ///
    /// The cron crate wants a seconds field, so a `0` is prepended; anything
    /// that is not exactly five fields is rejected before the crate sees it.
    pub fn parse_cron(expr: &str) -> Result<cron::Schedule, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "cron expression must have 5 fields, got {}: {expr}",
                fields.len()
            ));
        }
        let normalized = format!("0 {}", fields.join(" "));
        cron::Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression `{expr}`: {e}"))
    }

    /// Next fire strictly after `after`. `None` only for exhausted cron
    /// schedules.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(interval) => {
                Some(after + chrono::Duration::from_std(*interval).ok()?)
            }
            Trigger::Cron { schedule, .. } => schedule.after(&after).next(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval(_) => "interval",
            Trigger::Cron { .. } => "cron",
        }
    }

    pub fn spec_string(&self) -> String {
        match self {
            Trigger::Interval(interval) => interval.as_secs().to_string(),
            Trigger::Cron { expr, .. } => expr.clone(),
        }
    }
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.spec_string() == other.spec_string()
    }
}
