/// Build identity surfaced in the activity log banner and over RPC.
/// The stamp text is fully assembled by build.rs; a binary built without
/// it (rust-analyzer, some CI paths) degrades to a placeholder.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn build_stamp() -> &'static str {
    option_env!("PROCWARDEN_BUILD_STAMP").unwrap_or("build stamp unavailable")
}

pub fn banner() -> String {
    format!("procwarden {} ({})", version(), build_stamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_carries_the_package_version() {
        let b = banner();
        assert!(b.starts_with("procwarden "));
        assert!(b.contains(version()));
    }
}
