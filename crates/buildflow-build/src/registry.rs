//! レジストリ解決
//!
//! 名前付き参照から、プッシュ先のインデックス（レジストリ）情報を解決します。

use crate::error::{BuildError, BuildResult};
use crate::reference::{DEFAULT_DOMAIN, Named};
use std::net::IpAddr;

/// 公式インデックスの認証キー
pub const INDEX_SERVER: &str = "https://index.docker.io/v1/";

/// 公式インデックス名
pub const INDEX_NAME: &str = "docker.io";

/// レジストリ（インデックス）の情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub mirrors: Vec<String>,
    /// TLS 検証を行うか
    pub secure: bool,
    /// Docker Hub か
    pub official: bool,
}

/// リポジトリとそのインデックス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub name: Named,
    pub index: IndexInfo,
    pub official: bool,
}

/// 参照からリポジトリ情報を解決するサービス
///
/// 複数のビルドから同時に呼ばれるため Send + Sync が必要。
pub trait RegistryService: Send + Sync {
    fn resolve_repository(&self, name: &Named) -> BuildResult<RepositoryInfo>;
}

/// レジストリサービスの設定
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// TLS 検証を行わないレジストリ（ホスト名、ホスト名:ポート）
    pub insecure_registries: Vec<String>,
    /// Docker Hub のミラー
    pub mirrors: Vec<String>,
}

/// 設定ファイルに基づく標準のレジストリサービス
#[derive(Debug, Clone, Default)]
pub struct DefaultRegistryService {
    options: ServiceOptions,
}

impl DefaultRegistryService {
    pub fn new(options: ServiceOptions) -> Self {
        Self { options }
    }

    fn new_index_info(&self, index_name: &str) -> BuildResult<IndexInfo> {
        let name = validate_index_name(index_name)?;

        if name == INDEX_NAME {
            return Ok(IndexInfo {
                name,
                mirrors: self.options.mirrors.clone(),
                secure: true,
                official: true,
            });
        }

        Ok(IndexInfo {
            secure: self.is_secure_index(&name),
            name,
            mirrors: Vec::new(),
            official: false,
        })
    }

    /// localhost、ループバックアドレス、明示的に登録されたレジストリは非セキュア扱い
    fn is_secure_index(&self, name: &str) -> bool {
        if self
            .options
            .insecure_registries
            .iter()
            .any(|r| r == name || r == host_part(name))
        {
            return false;
        }

        let host = host_part(name);
        if host == "localhost" {
            return false;
        }
        match host.trim_matches(['[', ']']).parse::<IpAddr>() {
            Ok(ip) => !ip.is_loopback(),
            Err(_) => true,
        }
    }
}

impl RegistryService for DefaultRegistryService {
    fn resolve_repository(&self, name: &Named) -> BuildResult<RepositoryInfo> {
        let index = self.new_index_info(name.domain())?;
        let official = index.official && !name.familiar().contains('/');

        tracing::debug!(
            "Resolved {} to index {} (secure: {}, official: {})",
            name,
            index.name,
            index.secure,
            index.official
        );

        Ok(RepositoryInfo {
            name: name.clone(),
            index,
            official,
        })
    }
}

/// `host:port` からホスト部分を取り出す
fn host_part(name: &str) -> &str {
    if name.starts_with('[') {
        // [::1]:5000 形式
        return name.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(name);
    }
    name.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(host, _)| host)
        .unwrap_or(name)
}

/// インデックス名を検証・正規化する
///
/// `index.docker.io` は `docker.io` に正規化される。
/// 空ラベルや `-` で始まる・終わるラベルはエラー。
pub fn validate_index_name(val: &str) -> BuildResult<String> {
    let name = if val == "index.docker.io" {
        DEFAULT_DOMAIN.to_string()
    } else {
        val.to_string()
    };

    let host = host_part(&name);
    if host.is_empty() || host.split('.').any(|label| label.is_empty()) {
        return Err(BuildError::RegistryResolution {
            index: val.to_string(),
            reason: "empty label in index name".to_string(),
        });
    }
    if host
        .split('.')
        .any(|label| label.starts_with('-') || label.ends_with('-'))
    {
        return Err(BuildError::RegistryResolution {
            index: val.to_string(),
            reason: "index name cannot begin or end with a hyphen".to_string(),
        });
    }

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::parse_normalized_named;

    fn resolve(reference: &str) -> RepositoryInfo {
        let service = DefaultRegistryService::new(ServiceOptions {
            insecure_registries: vec!["registry.internal:5000".to_string()],
            mirrors: vec!["https://mirror.example.com".to_string()],
        });
        service
            .resolve_repository(&parse_normalized_named(reference).unwrap())
            .unwrap()
    }

    #[test]
    fn test_resolve_docker_hub() {
        let info = resolve("nginx:latest");
        assert_eq!(info.index.name, "docker.io");
        assert!(info.index.official);
        assert!(info.index.secure);
        assert!(info.official);
        assert_eq!(info.index.mirrors, vec!["https://mirror.example.com"]);
    }

    #[test]
    fn test_resolve_user_repo_on_hub_is_not_official_repo() {
        let info = resolve("myuser/app");
        assert!(info.index.official);
        assert!(!info.official);
    }

    #[test]
    fn test_resolve_third_party_registry() {
        let info = resolve("ghcr.io/org/app:v1");
        assert_eq!(info.index.name, "ghcr.io");
        assert!(!info.index.official);
        assert!(info.index.secure);
        assert!(info.index.mirrors.is_empty());
    }

    #[test]
    fn test_resolve_localhost_is_insecure() {
        assert!(!resolve("localhost:5000/app").index.secure);
        assert!(!resolve("127.0.0.1:5000/app").index.secure);
    }

    #[test]
    fn test_resolve_configured_insecure_registry() {
        assert!(!resolve("registry.internal:5000/app").index.secure);
    }

    #[test]
    fn test_validate_index_name() {
        assert_eq!(validate_index_name("index.docker.io").unwrap(), "docker.io");
        assert_eq!(validate_index_name("ghcr.io").unwrap(), "ghcr.io");
        assert!(validate_index_name("-bad.io").is_err());
        assert!(validate_index_name("bad-.io").is_err());
        assert!(validate_index_name("bad..io").is_err());
    }

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("localhost:5000"), "localhost");
        assert_eq!(host_part("ghcr.io"), "ghcr.io");
        assert_eq!(host_part("[::1]:5000"), "::1");
    }
}
