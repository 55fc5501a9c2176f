//! レジストリ認証ヘッダ
//!
//! ユーザー名・パスワード（とレジストリアドレス）を JSON にし、
//! base64url でエンコードしてプッシュ要求に渡します。

use crate::daemon::DaemonError;
use base64::Engine;
use bob_config::RegistryCredentials;
use bollard::auth::DockerCredentials;
use serde::{Deserialize, Serialize};

/// デーモンの `X-Registry-Auth` に載せる認証情報
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serveraddress: Option<String>,
}

impl AuthConfig {
    pub fn from_credentials(credentials: &RegistryCredentials) -> Self {
        Self {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            serveraddress: credentials
                .server_address
                .as_ref()
                .filter(|s| !s.is_empty())
                .cloned(),
        }
    }

    /// JSON → base64url
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::URL_SAFE.encode(json))
    }

    /// `encode` の逆変換
    pub fn decode(header: &str) -> Result<Self, DaemonError> {
        let json = base64::engine::general_purpose::URL_SAFE
            .decode(header)
            .map_err(|e| DaemonError::Auth(format!("Failed to decode auth header: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| DaemonError::Auth(format!("Failed to parse auth header: {}", e)))
    }
}

impl From<AuthConfig> for DockerCredentials {
    fn from(auth: AuthConfig) -> Self {
        DockerCredentials {
            username: Some(auth.username),
            password: Some(auth.password),
            serveraddress: auth.serveraddress,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(server: Option<&str>) -> RegistryCredentials {
        RegistryCredentials {
            username: "ci-bot".into(),
            password: "s3cr3t?>".into(),
            server_address: server.map(str::to_string),
        }
    }

    #[test]
    fn test_encode_is_url_safe_json() {
        let header = AuthConfig::from_credentials(&credentials(Some("registry.example.com")))
            .encode()
            .unwrap();
        assert!(!header.contains('+') && !header.contains('/'));

        let json = base64::engine::general_purpose::URL_SAFE
            .decode(&header)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["username"], "ci-bot");
        assert_eq!(value["password"], "s3cr3t?>");
        assert_eq!(value["serveraddress"], "registry.example.com");
    }

    #[test]
    fn test_server_address_omitted_when_unset() {
        let auth = AuthConfig::from_credentials(&credentials(Some("")));
        assert_eq!(auth.serveraddress, None);

        let json = serde_json::to_value(&auth).unwrap();
        assert!(json.get("serveraddress").is_none());
    }

    #[test]
    fn test_decode_into_docker_credentials() {
        let auth = AuthConfig::from_credentials(&credentials(Some("ghcr.io")));
        let decoded = AuthConfig::decode(&auth.encode().unwrap()).unwrap();
        assert_eq!(decoded, auth);

        let docker: DockerCredentials = decoded.into();
        assert_eq!(docker.username.as_deref(), Some("ci-bot"));
        assert_eq!(docker.serveraddress.as_deref(), Some("ghcr.io"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(AuthConfig::decode("%%%"), Err(DaemonError::Auth(_))));
    }
}
