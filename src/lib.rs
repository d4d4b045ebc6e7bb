pub mod app;
pub mod charts;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod email;
pub mod error;
pub mod http_client;
pub mod integration;
pub mod metric_cache;
pub mod models;
pub mod monthly_job;
pub mod providers;
pub mod report_pdf;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod test_support;
