//! Configuration for tool-relay
//!
//! Options are assembled either through [`RelayOptions::builder`] or from the
//! process environment with [`RelayOptions::from_env`]:
//!
//! | Variable                  | Meaning                                   |
//! |---------------------------|-------------------------------------------|
//! | `TOOL_RELAY_BASE_URL`     | OpenAI-compatible base URL (with `/v1`)   |
//! | `TOOL_RELAY_PROVIDER`     | default base URL when the above is unset  |
//! | `TOOL_RELAY_API_KEY`      | bearer token for the upstream             |
//! | `TOOL_RELAY_MAX_ROUNDS`   | cap on tool rounds per client request     |
//! | `TOOL_RELAY_TIMEOUT_SECS` | upstream connect and per-read timeout     |
//! | `TOOL_RELAY_LISTEN`       | socket address of the HTTP front          |

use crate::{Error, Result};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Hard stop for tool loops: the maximum number of tool rounds (tool execution
/// followed by a follow-up request) within one client request.
pub const MAX_TOOL_ROUNDS: u32 = 8;

/// Default upstream timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default listen address for the HTTP front.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8090";

pub const ENV_BASE_URL: &str = "TOOL_RELAY_BASE_URL";
pub const ENV_PROVIDER: &str = "TOOL_RELAY_PROVIDER";
pub const ENV_API_KEY: &str = "TOOL_RELAY_API_KEY";
pub const ENV_MAX_ROUNDS: &str = "TOOL_RELAY_MAX_ROUNDS";
pub const ENV_TIMEOUT_SECS: &str = "TOOL_RELAY_TIMEOUT_SECS";
pub const ENV_LISTEN: &str = "TOOL_RELAY_LISTEN";

/// Supported provider shortcuts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    LMStudio,
    Ollama,
    LlamaCpp,
    VLLM,
}

impl Provider {
    /// Get the default base URL for this provider
    pub fn default_url(&self) -> &'static str {
        match self {
            Provider::LMStudio => "http://localhost:1234/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::LlamaCpp => "http://localhost:8080/v1",
            Provider::VLLM => "http://localhost:8000/v1",
        }
    }

    /// Parse a provider from a string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lmstudio" | "lm-studio" | "lm_studio" => Some(Provider::LMStudio),
            "ollama" => Some(Provider::Ollama),
            "llamacpp" | "llama-cpp" | "llama_cpp" | "llama.cpp" => Some(Provider::LlamaCpp),
            "vllm" => Some(Provider::VLLM),
            _ => None,
        }
    }
}

/// Get the base URL from environment variable or provider default
///
/// Priority:
/// 1. `TOOL_RELAY_BASE_URL` environment variable
/// 2. Provider default URL (if provider is Some)
/// 3. fallback parameter
/// 4. LM Studio default
pub fn get_base_url(provider: Option<Provider>, fallback: Option<&str>) -> String {
    resolve_base_url(|key| env::var(key).ok(), provider, fallback)
}

fn resolve_base_url<F>(lookup: F, provider: Option<Provider>, fallback: Option<&str>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(ENV_BASE_URL).filter(|u| !u.trim().is_empty()) {
        return url;
    }

    if let Some(p) = provider {
        return p.default_url().to_string();
    }

    fallback
        .unwrap_or(Provider::LMStudio.default_url())
        .to_string()
}

/// Options for the relay
#[derive(Clone)]
pub struct RelayOptions {
    /// OpenAI-compatible base URL, e.g. `http://localhost:1234/v1`
    base_url: String,

    /// Bearer token (most local servers don't need one)
    api_key: Option<String>,

    /// Maximum number of tool rounds per client request
    max_rounds: u32,

    /// Upstream connect timeout, also the longest silence tolerated between
    /// reads of a streamed response
    timeout: Duration,

    /// Address the HTTP front binds to
    listen_addr: SocketAddr,
}

impl std::fmt::Debug for RelayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayOptions")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("max_rounds", &self.max_rounds)
            .field("timeout", &self.timeout)
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            base_url: Provider::LMStudio.default_url().to_string(),
            api_key: None,
            max_rounds: MAX_TOOL_ROUNDS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
        }
    }
}

impl RelayOptions {
    /// Create a new builder for RelayOptions
    pub fn builder() -> RelayOptionsBuilder {
        RelayOptionsBuilder::default()
    }

    /// Load options from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load options through an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = match lookup(ENV_PROVIDER) {
            Some(name) => Some(
                Provider::parse(&name)
                    .ok_or_else(|| Error::config(format!("unknown provider '{}'", name)))?,
            ),
            None => None,
        };

        let mut builder = Self::builder().base_url(resolve_base_url(&lookup, provider, None));

        if let Some(key) = lookup(ENV_API_KEY) {
            builder = builder.api_key(key);
        }
        if let Some(raw) = lookup(ENV_MAX_ROUNDS) {
            builder = builder.max_rounds(parse_number(ENV_MAX_ROUNDS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            builder = builder.timeout(Duration::from_secs(parse_number(ENV_TIMEOUT_SECS, &raw)?));
        }
        if let Some(raw) = lookup(ENV_LISTEN) {
            let addr = raw
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| Error::config(format!("{} is not a socket address: {}", ENV_LISTEN, e)))?;
            builder = builder.listen_addr(addr);
        }

        builder.build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL of the chat-completion endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| Error::config(format!("{} has invalid value '{}': {}", key, raw, e)))
}

/// Builder for RelayOptions
#[derive(Debug, Default)]
pub struct RelayOptionsBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    max_rounds: Option<u32>,
    timeout: Option<Duration>,
    listen_addr: Option<SocketAddr>,
}

impl RelayOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    pub fn build(self) -> Result<RelayOptions> {
        let defaults = RelayOptions::default();

        let base_url = self
            .base_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);
        if base_url.is_empty() {
            return Err(Error::config("base_url must not be empty"));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "base_url must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let max_rounds = self.max_rounds.unwrap_or(defaults.max_rounds);
        if max_rounds == 0 {
            return Err(Error::config("max_rounds must be at least 1"));
        }

        let timeout = self.timeout.unwrap_or(defaults.timeout);
        if timeout.is_zero() {
            return Err(Error::config("timeout must be greater than zero"));
        }

        // An empty key means "no key", same as leaving it unset.
        let api_key = self.api_key.filter(|k| !k.trim().is_empty());

        Ok(RelayOptions {
            base_url,
            api_key,
            max_rounds,
            timeout,
            listen_addr: self.listen_addr.unwrap_or(defaults.listen_addr),
        })
    }
}
