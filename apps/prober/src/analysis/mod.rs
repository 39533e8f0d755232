//! Network size analysis over the record store.

pub mod aggregator;
pub mod estimator;
pub mod reports;
pub mod series;

pub use aggregator::Aggregator;
pub use reports::{ReportSettings, write_reports};
pub use series::SeriesStore;
