//! Secret payloads as returned by the secret server.
//!
//! The wire shape is a JSON object with a base64-encoded `secret` field. The
//! server may omit padding, and listings may omit content entirely.

use std::fmt;
use std::ops::Deref;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Permission bits applied when a secret carries no usable mode.
pub const DEFAULT_MODE: u32 = 0o440;

/// A named secret as served by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    /// Payload bytes. Empty means the server listed the secret without
    /// inlining content (metadata-only).
    #[serde(rename = "secret", default)]
    pub content: SecretContent,
    /// Byte length as declared by the server, used for attribute reporting
    /// before content has been fetched.
    #[serde(rename = "secretLength", default)]
    pub length: u64,
    #[serde(rename = "creationDate")]
    pub created_at: DateTime<Utc>,
    /// Octal permission string, e.g. `"0440"`.
    #[serde(default)]
    pub mode: String,
    /// Textual owner; empty means default ownership applies.
    #[serde(default)]
    pub owner: String,
    /// Textual group; empty means default ownership applies.
    #[serde(default)]
    pub group: String,
    #[serde(rename = "isVersioned", default)]
    pub is_versioned: bool,
}

impl Secret {
    /// A content-free record for a name the server no longer serves.
    pub fn metadata_only(name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            content: SecretContent::default(),
            length: 0,
            created_at,
            mode: String::new(),
            owner: String::new(),
            group: String::new(),
            is_versioned: false,
        }
    }

    /// Permission bits for the exposed file. Unparseable or empty modes fall
    /// back to [`DEFAULT_MODE`].
    pub fn mode_value(&self) -> u32 {
        if self.mode.is_empty() {
            return DEFAULT_MODE;
        }
        match u32::from_str_radix(&self.mode, 8) {
            Ok(mode) if mode <= 0o177777 => mode,
            _ => {
                tracing::warn!(
                    name = %self.name,
                    mode = %self.mode,
                    "unable to parse secret mode as octal, using 0440"
                );
                DEFAULT_MODE
            }
        }
    }
}

/// Checks a name is usable as a secret file name: non-empty and not starting
/// with `.` (dot names are reserved for control entries).
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/')
}

/// Secret bytes. Kept behind a newtype so the raw bytes never end up in log
/// output via `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretContent(Vec<u8>);

impl SecretContent {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretContent({} bytes)", self.0.len())
    }
}

impl Deref for SecretContent {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<u8>> for SecretContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl<'de> Deserialize<'de> for SecretContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut encoded = String::deserialize(deserializer)?;
        // The server is allowed to omit base64 padding.
        let rem = encoded.len() % 4;
        if rem != 0 {
            encoded.extend(std::iter::repeat('=').take(4 - rem));
        }
        let decoded = BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Self(decoded))
    }
}

impl Serialize for SecretContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_JSON: &str = r#"{
        "name": "password-file",
        "secret": "aGVsbG8gd29ybGQ=",
        "secretLength": 11,
        "creationDate": "2011-09-29T15:46:00.232Z",
        "mode": "0440",
        "owner": "root",
        "group": "users",
        "isVersioned": false
    }"#;

    #[test]
    fn parses_full_secret() {
        let secret: Secret = serde_json::from_str(SECRET_JSON).unwrap();
        assert_eq!(secret.name, "password-file");
        assert_eq!(secret.content.as_bytes(), b"hello world");
        assert_eq!(secret.length, 11);
        assert_eq!(secret.owner, "root");
        assert_eq!(secret.group, "users");
        assert!(!secret.is_versioned);
        assert_eq!(secret.mode_value(), 0o440);
    }

    #[test]
    fn parses_content_without_padding() {
        let json = r#"{"name": "n", "secret": "aGVsbG8gd29ybGQ", "creationDate": "2011-09-29T15:46:00Z"}"#;
        let secret: Secret = serde_json::from_str(json).unwrap();
        assert_eq!(secret.content.as_bytes(), b"hello world");
    }

    #[test]
    fn rejects_invalid_base64() {
        let json = r#"{"name": "n", "secret": "!!!not-base64!!!", "creationDate": "2011-09-29T15:46:00Z"}"#;
        assert!(serde_json::from_str::<Secret>(json).is_err());
    }

    #[test]
    fn missing_fields_use_defaults() {
        let json = r#"{"name": "n", "creationDate": "2011-09-29T15:46:00Z"}"#;
        let secret: Secret = serde_json::from_str(json).unwrap();
        assert!(secret.content.is_empty());
        assert_eq!(secret.length, 0);
        assert!(secret.owner.is_empty());
        assert!(secret.group.is_empty());
        assert_eq!(secret.mode_value(), DEFAULT_MODE);
    }

    #[test]
    fn parses_list_with_metadata_only_entries() {
        let json = r#"[
            {"name": "a", "secret": "", "secretLength": 4, "creationDate": "2011-09-29T15:46:00Z"},
            {"name": "b", "secret": "Zm9v", "secretLength": 3, "creationDate": "2011-09-29T15:46:00Z"}
        ]"#;
        let secrets: Vec<Secret> = serde_json::from_str(json).unwrap();
        assert_eq!(secrets.len(), 2);
        assert!(secrets[0].content.is_empty());
        assert_eq!(secrets[1].content.as_bytes(), b"foo");
    }

    #[test]
    fn bad_modes_fall_back_to_default() {
        let mut secret: Secret = serde_json::from_str(SECRET_JSON).unwrap();

        secret.mode = "0777".into();
        assert_eq!(secret.mode_value(), 0o777);

        secret.mode = "rw-r-----".into();
        assert_eq!(secret.mode_value(), DEFAULT_MODE);

        secret.mode = String::new();
        assert_eq!(secret.mode_value(), DEFAULT_MODE);

        // Out of range for permission bits.
        secret.mode = "7777777".into();
        assert_eq!(secret.mode_value(), DEFAULT_MODE);
    }

    #[test]
    fn debug_never_prints_content() {
        let secret: Secret = serde_json::from_str(SECRET_JSON).unwrap();
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("hello"));
        assert!(rendered.contains("11 bytes"));
    }

    #[test]
    fn name_validation() {
        assert!(valid_name("password-file"));
        assert!(!valid_name(""));
        assert!(!valid_name(".hidden"));
        assert!(!valid_name("a/b"));
    }
}
