//! Process configuration, loaded from the environment the same way the
//! backend's `models::Config::from_env` does: `dotenv` load, `env::var` with
//! `unwrap_or_else` string defaults, `.parse().unwrap_or(default)` for
//! numerics.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    /// Comma-separated allowlist; localhost and `*.vercel.app` are always
    /// additionally permitted by the CORS layer regardless of this list.
    pub frontend_origins: Vec<String>,
    pub jwt_secret: String,
    pub refresh_secret: String,
    pub sweep_interval_secs: u64,
    /// Per-provider toggles for optional outbound services the core never
    /// calls directly (e.g. a messenger bot integration) — kept for
    /// interface completeness, same way the backend keeps
    /// `hashdive_api_key: Option<String>` on `Config` for an adjacent
    /// feature it doesn't itself drive.
    pub telegram_bot_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./marketwatch.db".to_string());

        let frontend_origins = std::env::var("FRONTEND_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let jwt_secret =
            std::env::var("JWT_SECRET").unwrap_or_else(|_| "dev-insecure-jwt-secret".to_string());

        let refresh_secret = std::env::var("REFRESH_SECRET")
            .unwrap_or_else(|_| "dev-insecure-refresh-secret".to_string());

        let sweep_interval_secs = std::env::var("ALERT_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .unwrap_or(7);

        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();

        Ok(Self {
            port,
            database_path,
            frontend_origins,
            jwt_secret,
            refresh_secret,
            sweep_interval_secs,
            telegram_bot_token,
        })
    }

    /// Additional allow-rule beyond the configured origin list: localhost
    /// at any port, and any `*.vercel.app` preview deployment.
    pub fn origin_is_allowed(&self, origin: &str) -> bool {
        if self.frontend_origins.iter().any(|o| o == origin) {
            return true;
        }
        if origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:") {
            return true;
        }
        origin
            .strip_prefix("https://")
            .map(|rest| rest.ends_with(".vercel.app"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            port: 8080,
            database_path: "./test.db".to_string(),
            frontend_origins: vec!["https://example.com".to_string()],
            jwt_secret: "secret".to_string(),
            refresh_secret: "refresh".to_string(),
            sweep_interval_secs: 7,
            telegram_bot_token: None,
        }
    }

    #[test]
    fn configured_origin_is_allowed() {
        assert!(sample_config().origin_is_allowed("https://example.com"));
    }

    #[test]
    fn localhost_is_always_allowed() {
        assert!(sample_config().origin_is_allowed("http://localhost:3000"));
    }

    #[test]
    fn vercel_preview_subdomains_are_allowed() {
        assert!(sample_config().origin_is_allowed("https://my-preview.vercel.app"));
    }

    #[test]
    fn unrelated_origin_is_rejected() {
        assert!(!sample_config().origin_is_allowed("https://evil.example"));
    }
}
