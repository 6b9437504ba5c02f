use std::sync::LazyLock;

use regex::Regex;

/// Name used when the configured platform name is not a valid identifier.
pub const FALLBACK_PLATFORM_NAME: &str = "supastack";

static PLATFORM_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z](?:[A-Za-z-]*[A-Za-z])?$").expect("platform name pattern is valid")
});

/// Whether `name` may be used to namespace networks and containers.
///
/// Letters and internal hyphens only; must start and end with a letter.
pub fn is_valid_platform_name(name: &str) -> bool {
    PLATFORM_NAME.is_match(name)
}

/// The namespace actually applied for `name`.
pub fn effective_platform_name(name: &str) -> &str {
    if is_valid_platform_name(name) {
        name
    } else {
        FALLBACK_PLATFORM_NAME
    }
}

/// Container name for `name`, prefixed with the platform when it is valid.
pub fn container_name(platform: &str, name: &str) -> String {
    if is_valid_platform_name(platform) {
        format!("{}-{}", platform, name)
    } else {
        name.to_string()
    }
}
