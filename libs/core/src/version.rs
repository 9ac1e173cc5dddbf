//! Product identity reported to the coordinator.

pub const NAME: &str = "quarry-agent";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build revision, injected at build time when available.
pub const REVISION: &str = match option_env!("QUARRY_REVISION") {
    Some(rev) => rev,
    None => "unknown",
};

/// User-Agent header value: `quarry-agent/<version>/<revision> (<platform>; <arch>)`.
pub fn user_agent() -> String {
    format!(
        "{NAME}/{VERSION}/{REVISION} ({}; {})",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_format() {
        let ua = user_agent();
        assert!(ua.starts_with("quarry-agent/"));
        assert!(ua.contains(std::env::consts::OS));
        assert!(ua.ends_with(')'));
    }
}
