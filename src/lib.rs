//! Electricity usage from the ESB Networks customer portal.
//!
//! [`portal::PortalClient`] replays the portal's browser sign-in, downloads
//! the interval export and wraps it in an [`aggregate::AggregateView`].
//! [`cache::UsageCache`] sits in front of it so repeated callers inside the
//! freshness window do not sign in again.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod portal;
pub mod service;

pub use aggregate::AggregateView;
pub use cache::{UsageCache, UsageSource};
pub use error::{AppError, ErrorKind, PortalError, Stage};
pub use models::{Reading, UsageTotals, UsageWindow};
pub use portal::{Credentials, PortalClient, PortalEndpoints};
