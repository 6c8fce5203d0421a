const fn unwrap_or_cargo_version(opt: Option<&'static str>) -> &'static str {
    match opt {
        Some(val) => val,
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// Release version, overridable at build time for packaged builds.
pub const VERSION: &str = unwrap_or_cargo_version(option_env!("FLUXWATCH_VERSION"));
