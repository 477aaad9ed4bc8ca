//! BuildFlow のデーモン側設定
//!
//! Docker への接続先とレジストリの扱いを `config.yaml` から読み込みます。

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "BUILDFLOW_CONFIG_PATH";

const CONFIG_FILE_NAME: &str = "config.yaml";
const PROJECT_CONFIG_DIR: &str = ".buildflow";

/// デーモン側の設定
///
/// ファイルに書かれていない項目はデフォルト値になる。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Docker デーモンの接続先（例: `unix:///var/run/docker.sock`, `tcp://host:2376`）
    pub docker_host: Option<String>,
    /// TLS 検証を行わないレジストリ
    pub insecure_registries: Vec<String>,
    /// Docker Hub のミラー
    pub registry_mirrors: Vec<String>,
    /// Docker クライアント設定ディレクトリ（config.json の場所）
    pub docker_config: Option<PathBuf>,
}

impl DaemonConfig {
    /// YAML 文字列から読み込む
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        // 空ファイルはデフォルト設定として扱う
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// ファイルから読み込む
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content, path)
    }
}

/// BuildFlowのグローバル設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("buildflow"))
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索し、見つからなければ None:
/// 1. 環境変数 BUILDFLOW_CONFIG_PATH (直接パス指定、存在しなければエラー)
/// 2. ./.buildflow/config.yaml
/// 3. ~/.config/buildflow/config.yaml (グローバル設定)
pub fn find_config_file() -> Result<Option<PathBuf>> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::ConfigFileNotFound(path));
    }

    // 2. ./.buildflow/ ディレクトリ
    let project_config = std::env::current_dir()?
        .join(PROJECT_CONFIG_DIR)
        .join(CONFIG_FILE_NAME);
    if project_config.is_file() {
        return Ok(Some(project_config));
    }

    // 3. グローバル設定ファイル
    if let Ok(config_dir) = get_config_dir() {
        let global_config = config_dir.join(CONFIG_FILE_NAME);
        if global_config.is_file() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

/// 設定を読み込む（設定ファイルがなければデフォルト）
pub fn load_config() -> Result<DaemonConfig> {
    match find_config_file()? {
        Some(path) => {
            tracing::debug!("Loading config from {}", path.display());
            DaemonConfig::from_file(&path)
        }
        None => {
            tracing::debug!("No config file found, using defaults");
            Ok(DaemonConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("buildflow"));
    }

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
docker_host: tcp://build-host:2376
insecure_registries:
  - registry.local:5000
registry_mirrors:
  - https://mirror.example.com
docker_config: /etc/buildflow/docker
"#;
        let config = DaemonConfig::from_yaml(yaml, Path::new("config.yaml")).unwrap();
        assert_eq!(config.docker_host.as_deref(), Some("tcp://build-host:2376"));
        assert_eq!(config.insecure_registries, vec!["registry.local:5000"]);
        assert_eq!(config.registry_mirrors, vec!["https://mirror.example.com"]);
        assert_eq!(
            config.docker_config,
            Some(PathBuf::from("/etc/buildflow/docker"))
        );
    }

    #[test]
    fn test_from_yaml_partial_and_empty() {
        let config =
            DaemonConfig::from_yaml("insecure_registries: [localhost:5000]\n", Path::new("c.yaml"))
                .unwrap();
        assert_eq!(config.docker_host, None);
        assert_eq!(config.insecure_registries, vec!["localhost:5000"]);

        let empty = DaemonConfig::from_yaml("\n", Path::new("c.yaml")).unwrap();
        assert_eq!(empty, DaemonConfig::default());
    }

    #[test]
    fn test_from_yaml_invalid() {
        let result = DaemonConfig::from_yaml("insecure_registries: 5\n", Path::new("bad.yaml"));
        match result {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, PathBuf::from("bad.yaml")),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "docker_host: unix:///tmp/docker.sock\n").unwrap();

        // 環境変数を設定
        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
        }

        let found = find_config_file().unwrap();
        assert_eq!(found, Some(config_path));
        let config = load_config().unwrap();
        assert_eq!(config.docker_host.as_deref(), Some("unix:///tmp/docker.sock"));

        // クリーンアップ
        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("missing.yaml");

        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, missing.to_str().unwrap());
        }

        let result = find_config_file();
        assert!(matches!(result, Err(ConfigError::ConfigFileNotFound(_))));

        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let project_dir = temp_dir.path().join(PROJECT_CONFIG_DIR);
        fs::create_dir(&project_dir).unwrap();
        fs::write(
            project_dir.join(CONFIG_FILE_NAME),
            "registry_mirrors: [https://mirror.local]\n",
        )
        .unwrap();

        // テンポラリディレクトリに移動
        std::env::set_current_dir(&temp_dir).unwrap();

        let found = find_config_file().unwrap().unwrap();
        assert!(found.ends_with(".buildflow/config.yaml"));
        let config = load_config().unwrap();
        assert_eq!(config.registry_mirrors, vec!["https://mirror.local"]);

        // 元のディレクトリに戻る
        std::env::set_current_dir(original_dir).unwrap();
    }
}
