pub mod config;
pub mod http_server;
pub mod metrics;
pub mod runner;
pub mod speedtest;
pub mod version;

#[cfg(test)]
mod test_support;
