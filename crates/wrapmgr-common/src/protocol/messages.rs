//! Typed payloads for each service method.

use serde::{Deserialize, Serialize};

/// Sentinel `adam_id` of a keep-alive frame on the Decrypt stream.
pub const KEEPALIVE_ADAM_ID: &str = "KEEPALIVE";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusData {
    /// `true` while at least one account is loaded.
    pub status: bool,
    pub regions: Vec<String>,
    pub client_count: usize,
    pub ready: bool,
}

/// Login stream item. An empty `two_step_code` starts a login, a non-empty one
/// answers a pending two-factor prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginData {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub two_step_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogoutData {
    pub username: String,
}

/// One sample on the Decrypt stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecryptData {
    pub adam_id: String,
    pub key: String,
    #[serde(default)]
    pub sample_index: u32,
    #[serde(default, with = "base64_bytes")]
    pub sample: Vec<u8>,
}

impl DecryptData {
    pub fn keepalive() -> Self {
        Self {
            adam_id: KEEPALIVE_ADAM_ID.to_string(),
            ..Default::default()
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.adam_id == KEEPALIVE_ADAM_ID
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct M3u8Request {
    pub adam_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct M3u8Data {
    pub adam_id: String,
    pub m3u8: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LyricsRequest {
    pub adam_id: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LyricsData {
    pub adam_id: String,
    /// TTML document.
    pub lyrics: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LicenseRequest {
    pub adam_id: String,
    #[serde(default)]
    pub challenge: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LicenseData {
    pub adam_id: String,
    pub license: String,
    pub renew: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebPlaybackRequest {
    pub adam_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebPlaybackData {
    pub adam_id: String,
    pub manifest: String,
}

/// Serde adapter carrying raw bytes as standard base64 text.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
