// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено (кроме RUST_LOG)

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Схема faux-URL, через которую shim отправляет сообщения нативной стороне
pub const DEFAULT_SCHEME: &str = "visiocall";

/// Сколько записей истории звонков храним
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// How the shim hands messages back to the native side.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryMode {
    /// Atomic message post (WebView2 `postMessage`, Tauri IPC).
    Direct,
    /// Resource-load interception; needs the one-at-a-time queue.
    Navigation,
}

impl DeliveryMode {
    /// Mode used by the host platform's webview.
    pub fn for_host() -> Self {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            DeliveryMode::Navigation
        } else {
            DeliveryMode::Direct
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct CallConfig {
    /// Количество гудков до автоответа
    pub ring_count: u32,
    /// Длительность одного гудка, мс
    pub ring_interval_ms: u64,
    /// Пауза между навигациями в очереди shim, мс
    pub settle_interval_ms: u64,
    pub scheme: String,
    pub history_limit: usize,
    pub ice_servers: Vec<ServerConfig>,
    /// `None` = pick by target platform
    pub delivery: Option<DeliveryMode>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_count: 3,
            ring_interval_ms: 5_000,
            settle_interval_ms: 100,
            scheme: DEFAULT_SCHEME.into(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            ice_servers: default_ice_servers(),
            delivery: None,
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Defaults with `VISIOCALL_SCHEME` / `VISIOCALL_RING_INTERVAL_MS` applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(scheme) = std::env::var("VISIOCALL_SCHEME") {
            if !scheme.is_empty() {
                cfg.scheme = scheme;
            }
        }
        if let Some(ms) = std::env::var("VISIOCALL_RING_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.ring_interval_ms = ms;
        }
        cfg
    }

    pub fn ring_interval(&self) -> Duration {
        Duration::from_millis(self.ring_interval_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    /// Total time the ringback runs before auto-answer.
    pub fn ring_duration(&self) -> Duration {
        self.ring_interval() * self.ring_count
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery.unwrap_or_else(DeliveryMode::for_host)
    }
}

/// Дефолтные STUN серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

/// Проверка пользовательских ICE серверов перед применением
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl(server.id.clone()));
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::MissingCredentials(server.id.clone()));
        }
    }
    Ok(())
}
