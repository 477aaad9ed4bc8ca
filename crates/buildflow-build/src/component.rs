//! イメージ操作の抽象化
//!
//! ビルド後の仕上げ処理（スカッシュ・タグ付け・プッシュ）が
//! イメージストアに要求する操作を定義します。

use crate::auth::AuthConfig;
use crate::error::BuildResult;
use crate::progress::ProgressOutput;
use crate::reference::Named;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// タグ付けで使うイメージID
///
/// ビルドエンジンが返す文字列IDとは区別し、
/// タグ付けの直前でのみ `From<String>` で変換する。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageId(String);

impl ImageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ImageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ビルドオーケストレーターが必要とするイメージ操作
///
/// 複数のビルドから同時に使われるため Send + Sync が必要。
#[async_trait]
pub trait ImageComponent: Send + Sync {
    /// `to` のレイヤーを `from`（ベースイメージ、空ならベースなし）に対して
    /// 1レイヤーにまとめ、新しいイメージIDを返す
    async fn squash_image(&self, to: &str, from: &str) -> BuildResult<String>;

    /// イメージに名前付き参照を関連付ける
    async fn tag_image(&self, image_id: &ImageId, reference: &Named) -> BuildResult<()>;

    /// イメージをレジストリにプッシュする
    ///
    /// `tag` が空の場合は `image` に含まれるタグを使う。
    async fn push_image(
        &self,
        cancel: &CancellationToken,
        image: &str,
        tag: &str,
        meta_headers: &HashMap<String, Vec<String>>,
        auth_config: &AuthConfig,
        output: ProgressOutput,
    ) -> BuildResult<()>;
}
