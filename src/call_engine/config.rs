//! Konfiguration der CallEngine
//!
//! Wird als JSON (camelCase) gelesen, alle Felder haben Defaults.

use super::media::{AudioConstraints, MediaConstraints, VideoConstraints};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid call configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Öffentliche STUN Server, die immer vor den konfigurierten stehen
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// STUN/TURN Server wie `RTCIceServer` im Browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// `urls` darf ein String oder eine Liste sein
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallConfig {
    /// Zusätzliche STUN/TURN Server
    pub ice_servers: Vec<IceServerConfig>,

    /// Maximale Anzahl Neuversuche bei Verbindungsabbruch
    pub max_retries: u32,

    /// Zeit bis `connected` erreicht sein muss
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Linearer Backoff: `retry_base_delay * retry_count`
    #[serde(with = "millis")]
    pub retry_base_delay: Duration,

    pub enable_video: bool,
    pub enable_audio: bool,
    pub enable_screen_share: bool,

    pub data_channel_label: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            max_retries: 3,
            connection_timeout: Duration::from_millis(30_000),
            retry_base_delay: Duration::from_millis(2_000),
            enable_video: true,
            enable_audio: true,
            enable_screen_share: true,
            data_channel_label: "messages".to_string(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Default STUN Server gefolgt von den konfigurierten
    pub fn resolved_ice_servers(&self) -> Vec<IceServerConfig> {
        DEFAULT_STUN_SERVERS
            .iter()
            .map(|url| IceServerConfig::stun(*url))
            .chain(self.ice_servers.iter().cloned())
            .collect()
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: self.enable_video.then(VideoConstraints::default),
            audio: self.enable_audio.then(AudioConstraints::default),
        }
    }

    /// Wartezeit vor Neuversuch Nummer `retry_count`
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.retry_base_delay.saturating_mul(retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert!(config.enable_video && config.enable_audio && config.enable_screen_share);

        let delays: Vec<u64> = (1..=3)
            .map(|n| config.retry_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2000, 4000, 6000]);
    }

    #[test]
    fn test_from_json_merges_ice_servers() {
        let config = CallConfig::from_json(
            r#"{
                "iceServers": [
                    { "urls": "turn:turn.sendeliver.test:3478", "username": "u", "credential": "p" },
                    { "urls": ["stun:a.test", "stun:b.test"] }
                ],
                "maxRetries": 5,
                "connectionTimeout": 10000,
                "enableScreenShare": false
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert!(!config.enable_screen_share);
        assert!(config.enable_video);

        let servers = config.resolved_ice_servers();
        assert_eq!(servers.len(), 4);
        assert_eq!(servers[0].urls, vec![DEFAULT_STUN_SERVERS[0].to_string()]);
        assert_eq!(servers[1].urls, vec![DEFAULT_STUN_SERVERS[1].to_string()]);
        assert_eq!(servers[2].username.as_deref(), Some("u"));
        assert_eq!(servers[3].urls.len(), 2);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CallConfig::from_json(r#"{ "maxRetries": "three" }"#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_media_constraints_follow_flags() {
        let config = CallConfig {
            enable_video: false,
            ..Default::default()
        };
        let constraints = config.media_constraints();
        assert!(constraints.video.is_none());

        let audio = constraints.audio.unwrap();
        assert!(audio.echo_cancellation && audio.noise_suppression && audio.auto_gain_control);

        let video = CallConfig::default().media_constraints().video.unwrap();
        assert_eq!((video.ideal_width, video.ideal_height), (1280, 720));
    }
}
