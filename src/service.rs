use crate::aggregate::AggregateView;
use crate::cache::UsageCache;
use crate::config::{normalize_mprn, AppConfig, MeterSettings};
use crate::error::AppError;
use crate::models::UsageTotals;
use crate::portal::{Credentials, PortalClient, ReqwestConnector};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of one meter's totals as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct MeterReport {
    pub mprn: String,
    pub readings: usize,
    pub latest_reading: Option<NaiveDateTime>,
    pub totals: UsageTotals,
    pub generated_at: DateTime<Local>,
}

impl MeterReport {
    pub fn from_view(mprn: &str, view: &AggregateView, now: DateTime<Local>) -> Self {
        Self {
            mprn: mprn.to_string(),
            readings: view.len(),
            latest_reading: view.latest().map(|r| r.end_timestamp),
            totals: view.totals_at(now.naive_local()),
            generated_at: now,
        }
    }
}

/// Pick the meter named by `mprn`, or the only configured meter.
pub fn select_meter<'a>(
    cfg: &'a AppConfig,
    mprn: Option<&str>,
) -> Result<&'a MeterSettings, AppError> {
    if let Some(mprn) = mprn {
        return cfg.meter(mprn).ok_or_else(|| {
            AppError::Config(format!(
                "Meter {} is not configured.",
                normalize_mprn(mprn)
            ))
        });
    }

    match cfg.meters.as_slice() {
        [] => Err(AppError::Config(
            "No meter configured. Run add-meter first.".into(),
        )),
        [only] => Ok(only),
        _ => Err(AppError::Config(
            "Several meters configured; pass --mprn to choose one.".into(),
        )),
    }
}

pub struct MeterService {
    mprn: String,
    cache: UsageCache<PortalClient<ReqwestConnector>>,
}

impl MeterService {
    pub fn new(cfg: &AppConfig, meter: &MeterSettings, password: String) -> Self {
        let credentials = Credentials::new(meter.username.clone(), password, meter.mprn.clone());
        let client = PortalClient::new(
            ReqwestConnector::new(cfg.request_timeout()),
            credentials,
            cfg.endpoints(),
        );
        Self {
            mprn: meter.mprn.clone(),
            cache: UsageCache::with_freshness(client, cfg.freshness()),
        }
    }

    pub fn mprn(&self) -> &str {
        &self.mprn
    }

    pub async fn refresh(&self) -> Result<Arc<AggregateView>, AppError> {
        Ok(self.cache.fetch().await?)
    }

    pub async fn report(&self) -> Result<MeterReport, AppError> {
        let view = self.refresh().await?;
        Ok(MeterReport::from_view(&self.mprn, &view, Local::now()))
    }
}
