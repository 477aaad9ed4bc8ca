//! レジストリ認証処理
//!
//! Docker config.json から認証情報を読み込み、レジストリごとの
//! `AuthConfig` マップを作ります。プッシュ時にはリポジトリの
//! インデックス情報からこのマップを引いて認証情報を選びます。

use crate::error::{BuildError, BuildResult};
use crate::registry::{INDEX_SERVER, IndexInfo};
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// レジストリ1つ分の認証情報
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Base64エンコードされた "username:password"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serveraddress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identitytoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registrytoken: Option<String>,
}

impl AuthConfig {
    /// 認証情報を一切持たないか
    pub fn is_empty(&self) -> bool {
        *self == AuthConfig::default()
    }
}

impl From<AuthConfig> for DockerCredentials {
    fn from(auth: AuthConfig) -> Self {
        DockerCredentials {
            username: auth.username,
            password: auth.password,
            auth: auth.auth,
            email: auth.email,
            serveraddress: auth.serveraddress,
            identitytoken: auth.identitytoken,
            registrytoken: auth.registrytoken,
        }
    }
}

/// インデックス情報に対応する認証情報を選ぶ
///
/// 公式インデックスは `https://index.docker.io/v1/` キーで引き、
/// それ以外はキーのスキーム・パスを除いたホスト名が一致するものを使う。
/// 見つからない場合は空の認証情報を返す（失敗はしない）。
pub fn resolve_auth_config(auth_configs: &HashMap<String, AuthConfig>, index: &IndexInfo) -> AuthConfig {
    let config_key = if index.official {
        INDEX_SERVER
    } else {
        index.name.as_str()
    };

    if let Some(config) = auth_configs.get(config_key) {
        return config.clone();
    }

    auth_configs
        .iter()
        .find(|(registry, _)| convert_to_hostname(registry) == config_key)
        .map(|(_, config)| config.clone())
        .unwrap_or_default()
}

/// `https://registry.example.com/v1/` → `registry.example.com`
pub fn convert_to_hostname(url: &str) -> &str {
    let stripped = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    stripped.split('/').next().unwrap_or(stripped)
}

/// Docker config.json の構造
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    /// 認証情報 (レジストリ -> AuthEntry)
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// credential helper 名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    creds_store: Option<String>,
    /// レジストリごとの credential helper
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

/// 認証エントリ
#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

/// credential helper からのレスポンス
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// Docker クライアント設定から認証情報を読み込む
#[derive(Debug)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    /// 新しい RegistryAuth を作成
    ///
    /// デフォルトで ~/.docker/config.json を使用
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self { config_path }
    }

    /// 指定したパスの config.json を使用
    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// config.json に登録されている全レジストリの認証情報を読み込む
    ///
    /// config.json が存在しない場合は空のマップを返す。
    /// credential helper で取得できなかったレジストリは黙って除外する。
    pub fn load_auth_configs(&self) -> BuildResult<HashMap<String, AuthConfig>> {
        let mut configs = HashMap::new();

        if !self.config_path.exists() {
            tracing::debug!("Docker config.json not found at {:?}", self.config_path);
            return Ok(configs);
        }

        let config = self.load_docker_config()?;

        for (registry, entry) in &config.auths {
            // 1. auths セクションの auth フィールド
            if let Some(auth_b64) = &entry.auth
                && !auth_b64.is_empty()
            {
                match self.decode_auth(auth_b64, registry) {
                    Ok(Some(mut auth)) => {
                        auth.identitytoken = entry.identitytoken.clone();
                        configs.insert(registry.clone(), auth);
                    }
                    Ok(None) => {}
                    // 壊れたエントリは他のレジストリの読み込みを妨げない
                    Err(e) => tracing::warn!("Skipping credentials for {}: {}", registry, e),
                }
                continue;
            }

            // 2. レジストリ固有の helper、なければ credsStore
            let helper = config
                .cred_helpers
                .get(convert_to_hostname(registry))
                .or(config.creds_store.as_ref());
            if let Some(helper) = helper {
                tracing::debug!("Trying credential helper {} for {}", helper, registry);
                if let Ok(Some(auth)) = self.get_from_helper(helper, registry) {
                    configs.insert(registry.clone(), auth);
                }
            }
        }

        // auths に載っていない credHelpers のレジストリ
        for (registry, helper) in &config.cred_helpers {
            if configs.contains_key(registry) {
                continue;
            }
            if let Ok(Some(auth)) = self.get_from_helper(helper, registry) {
                configs.insert(registry.clone(), auth);
            }
        }

        tracing::debug!("Loaded credentials for {} registries", configs.len());
        Ok(configs)
    }

    /// Docker config.json を読み込み
    fn load_docker_config(&self) -> BuildResult<DockerConfig> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|e| BuildError::AuthFailed {
                registry: self.config_path.display().to_string(),
                message: format!("Failed to read config.json: {}", e),
            })?;

        serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
            registry: self.config_path.display().to_string(),
            message: format!("Failed to parse config.json: {}", e),
        })
    }

    /// Base64エンコードされた認証情報をデコード
    fn decode_auth(&self, auth_b64: &str, registry: &str) -> BuildResult<Option<AuthConfig>> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth_b64)
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to decode auth: {}", e),
            })?;

        let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Invalid UTF-8 in auth: {}", e),
        })?;

        if let Some((username, password)) = auth_str.split_once(':') {
            Ok(Some(AuthConfig {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                serveraddress: Some(registry.to_string()),
                ..Default::default()
            }))
        } else {
            Ok(None)
        }
    }

    /// credential helper から認証情報を取得
    fn get_from_helper(&self, helper: &str, registry: &str) -> BuildResult<Option<AuthConfig>> {
        let helper_cmd = format!("docker-credential-{}", helper);

        let mut child = Command::new(&helper_cmd)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to run {}: {}", helper_cmd, e),
            })?;

        // レジストリ名を stdin に渡す
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(registry.as_bytes()).ok();
        }

        let output = child
            .wait_with_output()
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Credential helper failed: {}", e),
            })?;

        if !output.status.success() {
            // credential helper が認証情報を持っていない場合は None を返す
            tracing::debug!(
                "Credential helper returned error for {}: {}",
                registry,
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }

        let response: CredentialResponse =
            serde_json::from_slice(&output.stdout).map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to parse credential helper response: {}", e),
            })?;

        // ユーザー名 "<token>" はアイデンティティトークンを意味する
        let auth = if response.username == "<token>" {
            AuthConfig {
                identitytoken: Some(response.secret),
                serveraddress: Some(registry.to_string()),
                ..Default::default()
            }
        } else {
            AuthConfig {
                username: Some(response.username),
                password: Some(response.secret),
                serveraddress: Some(registry.to_string()),
                ..Default::default()
            }
        };
        Ok(Some(auth))
    }
}
