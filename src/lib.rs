pub mod config;
pub mod error;
pub mod feeds;
pub mod fetch;
pub mod geoip;
pub mod history;
pub mod merge;
pub mod model;
pub mod query;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod store;

#[cfg(test)]
mod test_support;

/// UTC timestamp format used on the wire and in the event logs.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
