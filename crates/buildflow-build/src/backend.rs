//! ビルドのオーケストレーション
//!
//! ビルドエンジンの実行 → スカッシュ（任意） → タグ付け → プッシュ（任意）
//! を順に実行し、各ステップの失敗を呼び出し側に伝えます。

use crate::auth::{AuthConfig, resolve_auth_config};
use crate::component::{ImageComponent, ImageId};
use crate::engine::{BuildConfig, BuildEngine, BuildOutput};
use crate::error::{BuildError, BuildFailure, BuildResult};
use crate::progress::StdoutFormatter;
use crate::reference::{parse_normalized_named, truncate_id};
use crate::registry::RegistryService;
use crate::tagger::Tagger;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// ビルド機能のエントリポイント
///
/// 保持するのは3つの協調コンポーネントへの参照のみで、
/// 呼び出しごとの状態は持たない。
#[derive(Clone)]
pub struct Backend {
    engine: Arc<dyn BuildEngine>,
    image_component: Arc<dyn ImageComponent>,
    registry_service: Arc<dyn RegistryService>,
}

impl Backend {
    pub fn new(
        image_component: Arc<dyn ImageComponent>,
        engine: Arc<dyn BuildEngine>,
        registry_service: Arc<dyn RegistryService>,
    ) -> Self {
        Self {
            engine,
            image_component,
            registry_service,
        }
    }

    /// イメージをビルドし、最終的なイメージIDを返す
    ///
    /// エンジンとスカッシュの失敗は致命的で、イメージIDなしで即座に返る。
    /// タグ付けの失敗ではプッシュを続行し、イメージID付きのエラーになる。
    pub async fn build(
        &self,
        cancel: &CancellationToken,
        config: &BuildConfig,
    ) -> Result<String, BuildFailure> {
        let options = &config.options;
        let mut tags = options.tags.clone();
        if !options.push_as.is_empty() {
            tags.push(options.push_as.clone());
        }

        let stdout = config.progress.stdout.clone();
        let tagger = Tagger::new(self.image_component.clone(), stdout.clone(), &tags)
            .map_err(BuildFailure::fatal)?;

        let build = self
            .engine
            .build(cancel, config)
            .await
            .map_err(BuildFailure::fatal)?;
        tracing::info!("Build engine produced image {}", build.image_id);

        let mut image_id = build.image_id.clone();
        if options.squash {
            image_id = squash_build(&build, self.image_component.as_ref())
                .await
                .map_err(BuildFailure::fatal)?;
            tracing::info!("Squashed {} into {}", build.image_id, image_id);
        }

        let line = format!("Successfully built {}\n", truncate_id(&image_id));
        if let Err(e) = stdout.clone().write_all(line.as_bytes()) {
            tracing::debug!("Failed to write build status: {}", e);
        }

        let tag_result = tagger.tag_images(&ImageId::from(image_id.clone())).await;

        if options.push_as.is_empty() {
            return match tag_result {
                Ok(()) => Ok(image_id),
                Err(e) => Err(BuildFailure::with_image(image_id, e)),
            };
        }

        let push_result = self
            .push_image(cancel, &options.push_as, &options.auth_configs, &stdout)
            .await;

        match (push_result, tag_result) {
            (Err(push_err), Err(tag_err)) => {
                tracing::warn!(
                    "Tagging also failed before push of {}: {}",
                    options.push_as,
                    tag_err
                );
                Err(BuildFailure::with_image(image_id, push_err))
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(BuildFailure::with_image(image_id, e)),
            (Ok(()), Ok(())) => Ok(image_id),
        }
    }

    /// push_as の参照をレジストリにプッシュする
    ///
    /// 認証情報が見つからない場合は空の認証情報でプッシュを試みる。
    pub async fn push_image(
        &self,
        cancel: &CancellationToken,
        push_as: &str,
        auth_configs: &HashMap<String, AuthConfig>,
        output: &StdoutFormatter,
    ) -> BuildResult<()> {
        let reference = parse_normalized_named(push_as)?;
        let repo_info = self.registry_service.resolve_repository(&reference)?;
        let auth_config = resolve_auth_config(auth_configs, &repo_info.index);

        tracing::info!(
            "Pushing {} to {} (credentials: {})",
            reference,
            repo_info.index.name,
            if auth_config.is_empty() { "none" } else { "found" }
        );

        self.image_component
            .push_image(
                cancel,
                &reference.to_string(),
                "",
                &HashMap::new(),
                &auth_config,
                output.progress_output(),
            )
            .await
    }
}

/// ビルド結果をベースイメージに対してスカッシュする
///
/// ベースイメージがない（scratch からのビルド）場合は空文字列をベースとして渡す。
pub async fn squash_build(
    build: &BuildOutput,
    image_component: &dyn ImageComponent,
) -> BuildResult<String> {
    let from_id = build
        .from_image
        .as_ref()
        .map(|from| from.image_id())
        .unwrap_or("");

    image_component
        .squash_image(&build.image_id, from_id)
        .await
        .map_err(|e| BuildError::Squash {
            source: Box::new(e),
        })
}
