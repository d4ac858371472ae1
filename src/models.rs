use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// One interval record from the portal's CSV export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub end_timestamp: NaiveDateTime,
    pub value_kwh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageWindow {
    Today,
    Last24Hours,
    ThisWeek,
    Last7Days,
    ThisMonth,
    Last30Days,
}

impl UsageWindow {
    pub const ALL: [UsageWindow; 6] = [
        UsageWindow::Today,
        UsageWindow::Last24Hours,
        UsageWindow::ThisWeek,
        UsageWindow::Last7Days,
        UsageWindow::ThisMonth,
        UsageWindow::Last30Days,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            UsageWindow::Today => "Today",
            UsageWindow::Last24Hours => "Last 24 Hours",
            UsageWindow::ThisWeek => "This Week",
            UsageWindow::Last7Days => "Last 7 Days",
            UsageWindow::ThisMonth => "This Month",
            UsageWindow::Last30Days => "Last 30 Days",
        }
    }

    /// Earliest `end_timestamp` counted by this window when read at `now`.
    pub fn start(self, now: NaiveDateTime) -> NaiveDateTime {
        let midnight = now.date().and_time(NaiveTime::MIN);
        match self {
            UsageWindow::Today => midnight,
            UsageWindow::Last24Hours => now - Duration::hours(24),
            UsageWindow::ThisWeek => {
                midnight - Duration::days(i64::from(now.weekday().num_days_from_monday()))
            }
            UsageWindow::Last7Days => now - Duration::days(7),
            UsageWindow::ThisMonth => midnight - Duration::days(i64::from(now.day0())),
            UsageWindow::Last30Days => now - Duration::days(30),
        }
    }
}

/// All six window sums evaluated at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub today: f64,
    pub last_24_hours: f64,
    pub this_week: f64,
    pub last_7_days: f64,
    pub this_month: f64,
    pub last_30_days: f64,
}

impl UsageTotals {
    pub fn get(&self, window: UsageWindow) -> f64 {
        match window {
            UsageWindow::Today => self.today,
            UsageWindow::Last24Hours => self.last_24_hours,
            UsageWindow::ThisWeek => self.this_week,
            UsageWindow::Last7Days => self.last_7_days,
            UsageWindow::ThisMonth => self.this_month,
            UsageWindow::Last30Days => self.last_30_days,
        }
    }
}
