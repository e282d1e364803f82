//! Upstream URL policy.
//!
//! The effective API base is derived once per request from the chosen
//! account's credentials: an empty `resource_url` falls back to the vendor
//! default, a bare host gains `https://`, and the base always ends in `/v1`.
//! Web search lives outside the `/v1` tree on the same host.

use crate::oauth::DEFAULT_API_BASE;

/// Normalize an account's `resource_url` into the effective API base.
pub fn api_base(resource_url: Option<&str>) -> String {
    let raw = resource_url.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return DEFAULT_API_BASE.to_string();
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    let trimmed = with_scheme.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// Chat completion endpoint for a base.
pub fn chat_completions_url(base: &str) -> String {
    format!("{}/chat/completions", base)
}

/// Model listing endpoint for a base.
pub fn models_url(base: &str) -> String {
    format!("{}/models", base)
}

/// Web search endpoint: the `/v1` suffix comes off and the vendor's plugin
/// path goes on.
pub fn web_search_url(base: &str) -> String {
    let host = base.trim_end_matches('/').trim_end_matches("/v1");
    format!("{}/api/v1/indices/plugin/web_search", host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_resource_url_falls_back_to_default() {
        assert_eq!(api_base(None), DEFAULT_API_BASE);
        assert_eq!(api_base(Some("")), DEFAULT_API_BASE);
        assert_eq!(api_base(Some("   ")), DEFAULT_API_BASE);
    }

    #[test]
    fn bare_host_gains_scheme_and_v1() {
        assert_eq!(api_base(Some("portal.qwen.ai")), "https://portal.qwen.ai/v1");
    }

    #[test]
    fn existing_scheme_and_v1_are_preserved() {
        assert_eq!(
            api_base(Some("https://portal.qwen.ai/v1")),
            "https://portal.qwen.ai/v1"
        );
        assert_eq!(
            api_base(Some("http://localhost:9000")),
            "http://localhost:9000/v1"
        );
    }

    #[test]
    fn trailing_slash_does_not_double_v1() {
        assert_eq!(
            api_base(Some("https://portal.qwen.ai/v1/")),
            "https://portal.qwen.ai/v1"
        );
    }

    #[test]
    fn endpoint_urls() {
        let base = api_base(Some("portal.qwen.ai"));
        assert_eq!(
            chat_completions_url(&base),
            "https://portal.qwen.ai/v1/chat/completions"
        );
        assert_eq!(models_url(&base), "https://portal.qwen.ai/v1/models");
        assert_eq!(
            web_search_url(&base),
            "https://portal.qwen.ai/api/v1/indices/plugin/web_search"
        );
    }
}
