use chrono::{DateTime, Local};
use std::sync::OnceLock;

fn build_datetime() -> DateTime<Local> {
    let build_timestamp: i64 = env!("BUILD_TIME").parse().unwrap_or(0);
    DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now)
}

static VERSION_INFO: OnceLock<String> = OnceLock::new();
static SHORT_VERSION: OnceLock<String> = OnceLock::new();

pub fn get_version_info() -> &'static str {
    VERSION_INFO.get_or_init(|| {
        format!(
            "platecall {}\n\
         Build Time: {}\n\
         Git Commit: {}\n\
         Git Branch: {}\n\
         Git Status: {}",
            env!("CARGO_PKG_VERSION"),
            build_datetime().format("%Y-%m-%d %H:%M:%S %Z"),
            env!("GIT_COMMIT_HASH"),
            env!("GIT_BRANCH"),
            env!("GIT_DIRTY"),
        )
    })
}

/// Computed once; `/api/health` reports it on every probe.
pub fn get_short_version() -> &'static str {
    SHORT_VERSION.get_or_init(|| {
        let version = env!("CARGO_PKG_VERSION");
        let git_commit = env!("GIT_COMMIT_HASH");
        if env!("GIT_DIRTY") == "dirty" {
            format!("{}-{}-dirty", version, git_commit)
        } else {
            format!("{}-{}", version, git_commit)
        }
    })
}

/// Sent on outbound requests to an external call-start service.
pub fn get_useragent() -> String {
    format!(
        "platecall/{} (built {})",
        env!("CARGO_PKG_VERSION"),
        build_datetime().format("%Y-%m-%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_strings() {
        assert!(get_short_version().starts_with(env!("CARGO_PKG_VERSION")));
        assert!(get_version_info().starts_with("platecall "));
        assert!(get_useragent().starts_with("platecall/"));
        // repeated calls hand out the same allocation
        assert!(std::ptr::eq(get_short_version(), get_short_version()));
        assert!(std::ptr::eq(get_version_info(), get_version_info()));
    }
}
