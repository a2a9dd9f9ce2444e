//! Configuration for Courier
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::auth::default_cache_path;
use crate::deploy::{DeployOptions, DeployRequest, Manifest};
use crate::types::{CourierError, Result};

/// Courier - deploy application files over a realtime channel
#[derive(Parser, Debug, Clone)]
#[command(name = "courier")]
#[command(about = "Deploy application files over a Phoenix channel")]
pub struct Args {
    /// Service endpoint (host or https URL)
    #[arg(long, env = "COURIER_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key exchanged for an access token
    #[arg(long, env = "COURIER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Environment name, used as the token cache key
    #[arg(long = "env", env = "COURIER_ENV", default_value = "production")]
    pub environment: String,

    /// Application to deploy
    #[arg(long, env = "COURIER_APP_ID")]
    pub app_id: Option<String>,

    /// Version to deploy
    #[arg(long = "version", env = "COURIER_VERSION")]
    pub app_version: Option<String>,

    /// Directory the file paths are relative to
    #[arg(long, env = "COURIER_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Files to offer, relative to --dir
    #[arg(required = false)]
    pub files: Vec<String>,

    /// Install the version after deploying it
    #[arg(long, env = "COURIER_INSTALL", default_value = "false")]
    pub install: bool,

    /// Token cache file (defaults to the user config directory)
    #[arg(long, env = "COURIER_TOKEN_CACHE")]
    pub token_cache: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Channel join timeout in milliseconds
    #[arg(long, env = "COURIER_JOIN_TIMEOUT_MS", default_value = "10000")]
    pub join_timeout_ms: u64,

    /// Timeout for the manifest reply and HTTP auth calls in milliseconds
    #[arg(long, env = "COURIER_REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Per-file upload timeout in milliseconds
    #[arg(long, env = "COURIER_UPLOAD_TIMEOUT_MS", default_value = "60000")]
    pub upload_timeout_ms: u64,

    /// Deploy and install reply timeout in milliseconds
    #[arg(long, env = "COURIER_DEPLOY_TIMEOUT_MS", default_value = "120000")]
    pub deploy_timeout_ms: u64,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
            return Err("COURIER_ENDPOINT is required".to_string());
        }
        if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err("COURIER_API_KEY is required".to_string());
        }
        if self.app_id.as_deref().map_or(true, |a| a.trim().is_empty()) {
            return Err("--app-id is required".to_string());
        }
        if self.app_version.as_deref().map_or(true, |v| v.trim().is_empty()) {
            return Err("--version is required".to_string());
        }
        if self.environment.trim().is_empty() {
            return Err("--env must not be empty".to_string());
        }

        let timeouts = [
            self.join_timeout_ms,
            self.request_timeout_ms,
            self.upload_timeout_ms,
            self.deploy_timeout_ms,
        ];
        if timeouts.contains(&0) {
            return Err("timeouts must be greater than zero".to_string());
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn deploy_options(&self) -> DeployOptions {
        let deploy_timeout = Duration::from_millis(self.deploy_timeout_ms);
        DeployOptions {
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            manifest_timeout: self.request_timeout(),
            upload_timeout: Duration::from_millis(self.upload_timeout_ms),
            deploy_timeout,
            install_timeout: deploy_timeout,
            ..DeployOptions::default()
        }
    }

    /// Explicit cache path, else the per-user default.
    pub fn token_cache_path(&self) -> Option<PathBuf> {
        self.token_cache.clone().or_else(default_cache_path)
    }

    pub fn deploy_request(&self, manifest: Manifest) -> Result<DeployRequest> {
        Ok(DeployRequest {
            endpoint: required(&self.endpoint, "endpoint")?,
            api_key: required(&self.api_key, "api key")?,
            env: self.environment.clone(),
            app_id: required(&self.app_id, "app id")?,
            manifest,
            install: self.install,
        })
    }
}

fn required(value: &Option<String>, what: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CourierError::Config(format!("{} is required", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "courier",
            "--endpoint",
            "api.example.com",
            "--api-key",
            "key",
            "--app-id",
            "my-app",
            "--version",
            "1.0.1",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["a.scl", "b.scl"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.environment, "production");
        assert_eq!(args.files, vec!["a.scl", "b.scl"]);
        assert!(!args.install);

        let options = args.deploy_options();
        assert_eq!(options.join_timeout, Duration::from_secs(10));
        assert_eq!(options.manifest_timeout, Duration::from_secs(30));
        assert_eq!(options.install_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let args = parse(&["--upload-timeout-ms", "0"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validate_requires_app_id() {
        let mut args = parse(&[]);
        args.app_id = Some("  ".into());
        assert_eq!(args.validate().unwrap_err(), "--app-id is required");
    }

    #[test]
    fn test_deploy_request() {
        let args = parse(&["--env", "staging", "--install"]);
        let request = args.deploy_request(Manifest::new("1.0.1")).unwrap();
        assert_eq!(request.env, "staging");
        assert_eq!(request.app_id, "my-app");
        assert!(request.install);
    }

    #[test]
    fn test_explicit_token_cache_wins() {
        let args = parse(&["--token-cache", "/tmp/courier-tokens.json"]);
        assert_eq!(
            args.token_cache_path(),
            Some(PathBuf::from("/tmp/courier-tokens.json"))
        );
    }
}
