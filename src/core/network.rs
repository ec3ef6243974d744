//! Effective network settings: proxy selection and server-base resolution.

use crate::core::config::{NetworkConfig, ServerMode};

/// Proxy parameters handed to the download tool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxySettings {
    pub url: Option<String>,
    pub no_proxy: Vec<String>,
}

impl ProxySettings {
    /// Proxy to use for `url`, honouring the no-proxy host list.
    #[must_use]
    pub fn proxy_for(&self, url: &str) -> Option<&str> {
        let proxy = self.url.as_deref()?;
        let host = host_of(url)?;
        let bypass = self.no_proxy.iter().any(|entry| {
            let entry = entry.trim().trim_start_matches('.').to_ascii_lowercase();
            !entry.is_empty() && (host == entry || host.ends_with(&format!(".{entry}")))
        });
        if bypass { None } else { Some(proxy) }
    }
}

/// Source of proxy and server-base settings.
pub trait NetworkConfigProvider: Send + Sync {
    fn proxy(&self) -> ProxySettings;
    fn server_mode(&self) -> ServerMode;
    /// Base URL for the active server mode.
    fn server_base(&self) -> Option<String>;
}

/// Provider backed by the `[network]` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticNetworkConfig {
    config: NetworkConfig,
}

impl StaticNetworkConfig {
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl NetworkConfigProvider for StaticNetworkConfig {
    fn proxy(&self) -> ProxySettings {
        ProxySettings {
            url: self.config.proxy.clone(),
            no_proxy: self.config.no_proxy.clone(),
        }
    }

    fn server_mode(&self) -> ServerMode {
        self.config.server_mode
    }

    fn server_base(&self) -> Option<String> {
        match self.config.server_mode {
            ServerMode::Local => self.config.local_server_base.clone(),
            ServerMode::Cloud => self.config.cloud_server_base.clone(),
        }
    }
}

/// Resolve a catalog download reference against the active server base.
///
/// Absolute URLs and local paths pass through; relative references are joined
/// onto the base. With no base configured the reference is returned as-is and
/// the source check rejects it later.
#[must_use]
pub fn resolve_download_url(provider: &dyn NetworkConfigProvider, reference: &str) -> String {
    let trimmed = reference.trim();
    if crate::core::paths::classify_source(trimmed).is_some() {
        return trimmed.to_string();
    }
    match provider.server_base() {
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            trimmed.trim_start_matches('/')
        ),
        None => trimmed.to_string(),
    }
}

/// Lower-cased host portion of an http(s) URL.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = if host_port.starts_with('[') {
        host_port.split(']').next()?.trim_start_matches('[')
    } else {
        host_port.split(':').next()?
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
