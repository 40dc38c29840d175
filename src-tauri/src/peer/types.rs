use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// SDP offer/answer as it travels through signaling and the shim
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub r#type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            r#type: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            r#type: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат для WebRTC соединения
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, alias = "sdpmid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", alias = "sdpmlineindex")]
    pub sdp_mline_index: Option<u16>,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Decodes camelCase JSON regardless of key casing (`SDP`, `sdpMid`, `SdpMLineIndex`...).
///
/// Keys are folded to lowercase before deserializing; the structs above carry
/// lowercase aliases for their multi-word fields.
pub fn from_json_ci<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    serde_json::from_value(fold_keys(value))
}

fn fold_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), fold_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(fold_keys).collect()),
        other => other,
    }
}
