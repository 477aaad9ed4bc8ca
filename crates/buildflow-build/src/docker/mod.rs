//! Docker Engine (bollard) によるイメージ操作とビルドエンジンの実装

mod engine;
mod squash;

pub use engine::{DockerBuildEngine, resolve_base_image};

use crate::auth::AuthConfig;
use crate::component::{ImageComponent, ImageId};
use crate::error::{BuildError, BuildResult};
use crate::progress::{ProgressEvent, ProgressOutput};
use crate::reference::Named;
use async_trait::async_trait;
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{Either, Full};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Docker Engine に対するイメージ操作
#[derive(Clone)]
pub struct DockerImageComponent {
    docker: Docker,
}

impl DockerImageComponent {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// イメージのレイヤー（diff ID）一覧を取得
    async fn layers(&self, image: &str) -> BuildResult<Vec<String>> {
        let inspect = self.docker.inspect_image(image).await?;
        Ok(inspect
            .root_fs
            .and_then(|fs| fs.layers)
            .unwrap_or_default())
    }

    /// `docker save` の内容を一時ファイルに書き出して展開
    async fn save_image(&self, image: &str, dir: &std::path::Path) -> BuildResult<std::path::PathBuf> {
        let archive_path = dir.join("image.tar");
        let mut file = tokio::fs::File::create(&archive_path).await?;
        let mut stream = self.docker.export_image(image);
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        let saved_dir = dir.join("saved");
        let unpack_to = saved_dir.clone();
        tokio::task::spawn_blocking(move || -> BuildResult<()> {
            let file = std::fs::File::open(&archive_path)?;
            tar::Archive::new(std::io::BufReader::new(file)).unpack(&unpack_to)?;
            Ok(())
        })
        .await
        .map_err(|e| BuildError::SquashFailed(format!("unpack task failed: {}", e)))??;

        Ok(saved_dir)
    }

    /// `docker load` でアーカイブを読み込む
    async fn load_image(&self, archive: Vec<u8>) -> BuildResult<()> {
        #[allow(deprecated)]
        let options = bollard::image::ImportImageOptions { quiet: true };
        let body = Either::Left(Full::new(Bytes::from(archive)));

        #[allow(deprecated)]
        let mut stream = self.docker.import_image(options, body, None);
        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(err) = info.error {
                return Err(BuildError::SquashFailed(format!("failed to load squashed image: {}", err)));
            }
            if let Some(status) = info.stream {
                tracing::debug!("load: {}", status.trim_end());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageComponent for DockerImageComponent {
    async fn squash_image(&self, to: &str, from: &str) -> BuildResult<String> {
        let image_layers = self.layers(to).await?;
        let base_layers = if from.is_empty() {
            Vec::new()
        } else {
            self.layers(from).await?
        };

        if !image_layers.starts_with(&base_layers) {
            return Err(BuildError::SquashFailed(format!(
                "{} is not a parent of {}",
                from, to
            )));
        }
        if base_layers.len() == image_layers.len() {
            tracing::info!("No layers to squash in {}", to);
            return Ok(to.to_string());
        }

        tracing::info!(
            "Squashing {} layers of {} onto {}",
            image_layers.len() - base_layers.len(),
            to,
            if from.is_empty() { "scratch" } else { from }
        );

        let temp_dir = tempfile::tempdir()?;
        let saved_dir = self.save_image(to, temp_dir.path()).await?;

        let base_count = base_layers.len();
        let comment = if from.is_empty() {
            format!("merge {}", to)
        } else {
            format!("merge {} to {}", to, from)
        };
        let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let squashed = tokio::task::spawn_blocking(move || {
            squash::squash_saved_image(&saved_dir, base_count, &comment, &created)
        })
        .await
        .map_err(|e| BuildError::SquashFailed(format!("squash task failed: {}", e)))??;

        self.load_image(squashed.archive).await?;
        Ok(squashed.image_id)
    }

    async fn tag_image(&self, image_id: &ImageId, reference: &Named) -> BuildResult<()> {
        let tag = reference.tag().unwrap_or(crate::reference::DEFAULT_TAG);
        let repo = reference.name();

        #[allow(deprecated)]
        let options = bollard::image::TagImageOptions {
            repo: repo.as_str(),
            tag,
        };

        self.docker
            .tag_image(image_id.as_str(), Some(options))
            .await
            .map_err(|e| BuildError::TagFailed {
                reference: reference.to_string(),
                message: e.to_string(),
            })
    }

    async fn push_image(
        &self,
        cancel: &CancellationToken,
        image: &str,
        tag: &str,
        meta_headers: &HashMap<String, Vec<String>>,
        auth_config: &AuthConfig,
        output: ProgressOutput,
    ) -> BuildResult<()> {
        let (repository, embedded_tag) = split_image_tag(image);
        let tag = if tag.is_empty() { embedded_tag } else { tag.to_string() };

        if !meta_headers.is_empty() {
            tracing::debug!("Ignoring {} meta headers for push", meta_headers.len());
        }

        let credentials = if auth_config.is_empty() {
            None
        } else {
            Some(auth_config.clone().into())
        };

        // プッシュオプション
        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> { tag: tag.clone() };

        tracing::info!("Pushing {}:{}", repository, tag);

        #[allow(deprecated)]
        let mut stream = self.docker.push_image(&repository, Some(options), credentials);

        let mut error_message: Option<String> = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(BuildError::Cancelled),
                next = stream.next() => next,
            };
            let Some(result) = next else { break };

            let info = result.map_err(|e| BuildError::PushFailed {
                message: e.to_string(),
            })?;
            if let Some(err) = info.error {
                error_message = Some(err);
                continue;
            }
            if let Some(status) = info.status {
                let event = ProgressEvent {
                    id: String::new(),
                    action: status,
                    progress: info.progress,
                    current: info.progress_detail.as_ref().and_then(|d| d.current),
                    total: info.progress_detail.as_ref().and_then(|d| d.total),
                };
                output.write_progress(&event)?;
            }
        }

        // エラーがあった場合
        if let Some(err) = error_message {
            return Err(BuildError::PushFailed { message: err });
        }

        Ok(())
    }
}

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app` -> `("localhost:5000/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
pub fn split_image_tag(image: &str) -> (String, String) {
    // ダイジェストはタグとして扱わない
    let image = image.split_once('@').map(|(name, _)| name).unwrap_or(image);

    // 最後の : を探す
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // ポート番号の場合: localhost:5000/app (タグなし)
        if !potential_tag.contains('/') {
            return (potential_image.to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), crate::reference::DEFAULT_TAG.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_tag_with_tag() {
        let (image, tag) = split_image_tag("ghcr.io/org/app:v1.0");
        assert_eq!(image, "ghcr.io/org/app");
        assert_eq!(tag, "v1.0");
    }

    #[test]
    fn test_split_image_tag_without_tag() {
        let (image, tag) = split_image_tag("docker.io/library/nginx");
        assert_eq!(image, "docker.io/library/nginx");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_split_image_tag_with_port() {
        let (image, tag) = split_image_tag("localhost:5000/app");
        assert_eq!(image, "localhost:5000/app");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_split_image_tag_with_port_and_tag() {
        let (image, tag) = split_image_tag("localhost:5000/app:dev");
        assert_eq!(image, "localhost:5000/app");
        assert_eq!(tag, "dev");
    }

    #[test]
    fn test_split_image_tag_numeric_tag() {
        // 正規化済みの参照ではドメインに / が続くため数字タグも判定できる
        let (image, tag) = split_image_tag("docker.io/library/redis:7");
        assert_eq!(image, "docker.io/library/redis");
        assert_eq!(tag, "7");
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_tag_and_squash_local_image() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let component = DockerImageComponent::new(docker);

        let image = component.docker.inspect_image("alpine:latest").await.unwrap();
        let image_id = ImageId::from(image.id.unwrap());
        let reference = crate::reference::parse_normalized_named("buildflow-test:squash").unwrap();
        component.tag_image(&image_id, &reference).await.unwrap();

        let squashed = component
            .squash_image(image_id.as_str(), "")
            .await
            .unwrap();
        assert!(squashed.starts_with("sha256:"));

        // クリーンアップ
        component
            .docker
            .remove_image(
                "buildflow-test:squash",
                None::<bollard::query_parameters::RemoveImageOptions>,
                None,
            )
            .await
            .ok();
    }
}
