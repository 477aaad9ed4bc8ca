//! ビルド済みイメージへのタグ付け

use crate::component::{ImageComponent, ImageId};
use crate::error::{BuildError, BuildResult};
use crate::progress::StdoutFormatter;
use crate::reference::{Named, parse_normalized_named};
use std::io::Write;
use std::sync::Arc;

/// 固定の参照セットをイメージに付与する
pub struct Tagger {
    component: Arc<dyn ImageComponent>,
    stdout: StdoutFormatter,
    references: Vec<Named>,
}

impl Tagger {
    /// 参照文字列を検証して Tagger を作成
    ///
    /// - パースできない参照があればエラー
    /// - ダイジェスト付きの参照はエラー
    /// - タグのない参照には `latest` を付与
    /// - 重複は最初の出現位置を残して除去
    pub fn new(
        component: Arc<dyn ImageComponent>,
        stdout: StdoutFormatter,
        tags: &[String],
    ) -> BuildResult<Self> {
        let mut references: Vec<Named> = Vec::with_capacity(tags.len());

        for tag in tags {
            let named = parse_normalized_named(tag)?;
            if named.digest().is_some() {
                return Err(BuildError::DigestInTag(tag.clone()));
            }
            let named = named.with_default_tag();
            if !references.contains(&named) {
                references.push(named);
            }
        }

        Ok(Self {
            component,
            stdout,
            references,
        })
    }

    pub fn references(&self) -> &[Named] {
        &self.references
    }

    /// 全ての参照をイメージに付与する
    ///
    /// 途中で失敗しても残りの参照の付与は続け、最初のエラーを返す。
    pub async fn tag_images(&self, image_id: &ImageId) -> BuildResult<()> {
        let mut first_error = None;

        for reference in &self.references {
            match self.component.tag_image(image_id, reference).await {
                Ok(()) => {
                    let line = format!("Successfully tagged {}\n", reference.familiar());
                    // 出力の失敗でタグ付けは止めない
                    if let Err(e) = self.stdout.clone().write_all(line.as_bytes()) {
                        tracing::debug!("Failed to write tag status: {}", e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to tag {} as {}: {}", image_id, reference, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
