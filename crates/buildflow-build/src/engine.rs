//! ビルドエンジンとビルド設定

use crate::auth::AuthConfig;
use crate::error::BuildResult;
use crate::progress::ProgressWriter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// ビルドオプション
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// ビルド後に付与するタグ
    pub tags: Vec<String>,
    /// ビルド後にプッシュする参照（空文字列ならプッシュしない）
    pub push_as: String,
    /// レイヤーをスカッシュするか
    pub squash: bool,
    /// レジストリごとの認証情報
    pub auth_configs: HashMap<String, AuthConfig>,

    /// ビルドコンテキストのディレクトリ
    pub context_dir: PathBuf,
    /// Dockerfile のパス（None ならコンテキスト直下の Dockerfile）
    pub dockerfile: Option<PathBuf>,
    pub build_args: HashMap<String, String>,
    /// マルチステージビルドのターゲット
    pub target: Option<String>,
    pub no_cache: bool,
    /// ベースイメージを常に pull するか
    pub pull: bool,
    pub labels: HashMap<String, String>,
}

/// 1回のビルド要求
///
/// `Backend::build` の呼び出し中は変更されない。
#[derive(Clone)]
pub struct BuildConfig {
    pub options: BuildOptions,
    pub progress: ProgressWriter,
}

/// ビルドのベースイメージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromImage {
    image_id: String,
}

impl FromImage {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
        }
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }
}

/// ビルドエンジンの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub image_id: String,
    /// scratch からのビルドでは None
    pub from_image: Option<FromImage>,
}

/// ビルド命令を実行してイメージを作るエンジン
///
/// キャンセルされた場合は `BuildError::Cancelled` を返す。
#[async_trait]
pub trait BuildEngine: Send + Sync {
    async fn build(&self, cancel: &CancellationToken, config: &BuildConfig) -> BuildResult<BuildOutput>;
}
