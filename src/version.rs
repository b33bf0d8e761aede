/// Build-time override via `SPEEDTEST_EXPORTER_VERSION`, otherwise the crate version.
pub const VERSION: &str = match option_env!("SPEEDTEST_EXPORTER_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};
