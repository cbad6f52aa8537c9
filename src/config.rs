use std::env;

/// Runtime configuration for the Copyforge API client.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the dashboard session. Optional: without it the
    /// startup balance fetch is skipped and requests go out unauthenticated.
    pub token: Option<String>,
    pub api_url: String,
    /// Path of the credits endpoint, relative to `api_url`.
    pub credits_path: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - COPYFORGE_API_TOKEN (optional)
    /// - COPYFORGE_API_URL (default: https://api.copyforge.io)
    /// - COPYFORGE_CREDITS_PATH (default: /user/credits)
    /// - COPYFORGE_HTTP_TIMEOUT_SECS (default: 30)
    /// - COPYFORGE_USER_AGENT (default: copyforge/<version>)
    pub fn from_env() -> Self {
        let token = env::var("COPYFORGE_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let api_url = env::var("COPYFORGE_API_URL")
            .unwrap_or_else(|_| "https://api.copyforge.io".to_string());
        let credits_path =
            env::var("COPYFORGE_CREDITS_PATH").unwrap_or_else(|_| "/user/credits".to_string());
        let timeout_secs = env::var("COPYFORGE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        let default_ua = format!(
            "copyforge/{} (+https://copyforge.io)",
            env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".into())
        );
        let user_agent = env::var("COPYFORGE_USER_AGENT").unwrap_or(default_ua);

        Self {
            token,
            api_url,
            credits_path,
            user_agent,
            timeout_secs,
        }
    }
}
