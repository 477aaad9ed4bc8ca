use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("Build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("invalid reference format: {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("build tag cannot contain a digest: {0}")]
    DigestInTag(String),

    #[error("Build failed: {0}")]
    EngineFailed(String),

    #[error("error squashing image: {source}")]
    Squash {
        #[source]
        source: Box<BuildError>,
    },

    #[error("Layer squash failed: {0}")]
    SquashFailed(String),

    #[error("Failed to tag {reference}: {message}")]
    TagFailed { reference: String, message: String },

    #[error("Push failed: {message}")]
    PushFailed { message: String },

    #[error("Invalid registry index {index}: {reason}")]
    RegistryResolution { index: String, reason: String },

    #[error("Authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        BuildError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// 呼び出し側が同じ入力で再試行しても成功しないエラーか
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            BuildError::InvalidReference { .. }
                | BuildError::DigestInTag(_)
                | BuildError::InvalidConfig(_)
                | BuildError::DockerfileNotFound(_)
                | BuildError::ContextNotFound(_)
        )
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::DockerfileNotFound(path) => {
                format!(
                    "Dockerfileが見つかりません: {}\n\
                     \n\
                     解決方法:\n\
                     1. Dockerfileのパスを確認してください\n\
                     2. -f オプションで明示的にパスを指定してください:\n\
                        bflow build -f path/to/Dockerfile .",
                    path.display()
                )
            }
            BuildError::EngineFailed(msg) => {
                format!(
                    "ビルドに失敗しました: {}\n\
                     \n\
                     Dockerfileの内容を確認してください。",
                    msg
                )
            }
            BuildError::ContextNotFound(path) => {
                format!(
                    "ビルドコンテキストが見つかりません: {}\n\
                     \n\
                     コンテキストのパスを確認してください。",
                    path.display()
                )
            }
            BuildError::InvalidReference { reference, reason } => {
                format!(
                    "イメージ参照 '{}' が不正です: {}\n\
                     \n\
                     例: myapp:latest, ghcr.io/org/app:v1.0",
                    reference, reason
                )
            }
            BuildError::PushFailed { message } => {
                format!(
                    "プッシュに失敗しました: {}\n\
                     \n\
                     ヒント:\n  • docker login でレジストリにログインしているか確認してください",
                    message
                )
            }
            _ => format!("{}", self),
        }
    }
}

/// ビルド全体の失敗
///
/// タグ付け・プッシュの失敗ではイメージ自体は存在するため `image_id` を保持する。
/// エンジン失敗やスカッシュ失敗など致命的な場合は `None`。
#[derive(Debug, Error)]
#[error("{error}")]
pub struct BuildFailure {
    pub image_id: Option<String>,
    #[source]
    pub error: BuildError,
}

impl BuildFailure {
    pub fn fatal(error: BuildError) -> Self {
        Self {
            image_id: None,
            error,
        }
    }

    pub fn with_image(image_id: impl Into<String>, error: BuildError) -> Self {
        Self {
            image_id: Some(image_id.into()),
            error,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
pub type BuildResult<T> = Result<T>;
