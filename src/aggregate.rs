use crate::models::{Reading, UsageTotals, UsageWindow};
use chrono::{Local, NaiveDateTime};

/// Rolling usage sums over the readings of one fetch cycle.
///
/// Window starts are computed when a sum is read, not when the view is
/// built, so the same view yields a new `today` after midnight.
#[derive(Debug, Clone, Default)]
pub struct AggregateView {
    readings: Vec<Reading>,
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl AggregateView {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self { readings }
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Reading with the most recent interval end.
    pub fn latest(&self) -> Option<&Reading> {
        self.readings.iter().max_by_key(|r| r.end_timestamp)
    }

    pub fn sum_since(&self, since: NaiveDateTime) -> f64 {
        self.readings
            .iter()
            .filter(|r| r.end_timestamp >= since)
            .map(|r| r.value_kwh)
            .sum()
    }

    pub fn total_at(&self, window: UsageWindow, now: NaiveDateTime) -> f64 {
        self.sum_since(window.start(now))
    }

    pub fn total(&self, window: UsageWindow) -> f64 {
        self.total_at(window, local_now())
    }

    pub fn totals_at(&self, now: NaiveDateTime) -> UsageTotals {
        UsageTotals {
            today: self.total_at(UsageWindow::Today, now),
            last_24_hours: self.total_at(UsageWindow::Last24Hours, now),
            this_week: self.total_at(UsageWindow::ThisWeek, now),
            last_7_days: self.total_at(UsageWindow::Last7Days, now),
            this_month: self.total_at(UsageWindow::ThisMonth, now),
            last_30_days: self.total_at(UsageWindow::Last30Days, now),
        }
    }

    pub fn totals(&self) -> UsageTotals {
        self.totals_at(local_now())
    }

    pub fn today(&self) -> f64 {
        self.total(UsageWindow::Today)
    }

    pub fn last_24_hours(&self) -> f64 {
        self.total(UsageWindow::Last24Hours)
    }

    pub fn this_week(&self) -> f64 {
        self.total(UsageWindow::ThisWeek)
    }

    pub fn last_7_days(&self) -> f64 {
        self.total(UsageWindow::Last7Days)
    }

    pub fn this_month(&self) -> f64 {
        self.total(UsageWindow::ThisMonth)
    }

    pub fn last_30_days(&self) -> f64 {
        self.total(UsageWindow::Last30Days)
    }
}
