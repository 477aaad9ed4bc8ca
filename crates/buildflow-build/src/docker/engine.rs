use crate::context::{ContextBuilder, DOCKERFILE_NAME};
use crate::engine::{BuildConfig, BuildEngine, BuildOutput, FromImage};
use crate::error::{BuildError, BuildResult};
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use http_body_util::{Either, Full};
use std::collections::HashMap;
use std::io::Write;
use tokio_util::sync::CancellationToken;

/// Docker Engine の build API を使うビルドエンジン
#[derive(Clone)]
pub struct DockerBuildEngine {
    docker: Docker,
}

impl DockerBuildEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// ビルド出力の処理
    ///
    /// イメージIDを含む aux メッセージを受け取った場合はそのIDを返す。
    fn handle_build_output(
        &self,
        output: bollard::models::BuildInfo,
        config: &BuildConfig,
    ) -> BuildResult<Option<String>> {
        if let Some(error) = output.error {
            // エラーが発生した場合
            return Err(BuildError::EngineFailed(error));
        }

        if let Some(error_detail) = output.error_detail {
            // 詳細なエラー情報
            let error_msg = error_detail
                .message
                .unwrap_or_else(|| "Unknown build error".to_string());
            return Err(BuildError::EngineFailed(error_msg));
        }

        let mut stdout = config.progress.stdout.clone();
        if let Some(stream) = output.stream {
            // ビルドステップの出力
            stdout.write_all(stream.as_bytes())?;
        }

        if let Some(status) = output.status {
            // ステータスメッセージ（pull等）
            stdout.write_all(format!("{}\n", status).as_bytes())?;
        }

        Ok(output.aux.and_then(|aux| aux.id))
    }

    /// ビルド引数の検証（機密情報の警告）
    fn validate_build_arg(key: &str) {
        let sensitive_patterns = ["password", "token", "secret", "api_key", "private_key"];

        let key_lower = key.to_lowercase();
        if sensitive_patterns.iter().any(|p| key_lower.contains(p)) {
            tracing::warn!(
                "警告: ビルド引数 '{}' は機密情報を含む可能性があります。\n\
                 ビルド引数はイメージ履歴に記録されます。\n\
                 機密情報はビルド引数ではなく、シークレットマウントを使用してください。",
                key
            );
        }
    }
}

#[async_trait]
impl BuildEngine for DockerBuildEngine {
    async fn build(&self, cancel: &CancellationToken, config: &BuildConfig) -> BuildResult<BuildOutput> {
        let options = &config.options;
        let context_dir = options.context_dir.clone();
        let dockerfile_path = options
            .dockerfile
            .clone()
            .unwrap_or_else(|| context_dir.join(DOCKERFILE_NAME));

        tracing::info!(
            "Building {} with {}",
            context_dir.display(),
            dockerfile_path.display()
        );

        let dockerfile_content = tokio::fs::read_to_string(&dockerfile_path)
            .await
            .map_err(|_| BuildError::DockerfileNotFound(dockerfile_path.clone()))?;

        let context_data = {
            let context_dir = context_dir.clone();
            let dockerfile_path = dockerfile_path.clone();
            tokio::task::spawn_blocking(move || {
                ContextBuilder::create_context(&context_dir, &dockerfile_path)
            })
            .await
            .map_err(|e| BuildError::EngineFailed(format!("context task failed: {}", e)))??
        };

        for key in options.build_args.keys() {
            Self::validate_build_arg(key);
        }

        // build_argsを&str型に変換
        let build_args_refs: HashMap<&str, &str> = options
            .build_args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let labels_refs: HashMap<&str, &str> = options
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        // タグ付けはビルド後に行うため t は指定しない
        #[allow(deprecated)]
        let build_options = bollard::image::BuildImageOptions {
            dockerfile: DOCKERFILE_NAME,
            t: "",
            buildargs: build_args_refs,
            labels: labels_refs,
            target: options.target.as_deref().unwrap_or(""),
            nocache: options.no_cache,
            rm: true,      // 中間コンテナを削除
            forcerm: true, // ビルド失敗時も中間コンテナを削除
            pull: options.pull,
            ..Default::default()
        };

        // ベースイメージの pull 用認証情報
        let credentials: HashMap<String, DockerCredentials> = options
            .auth_configs
            .iter()
            .map(|(registry, auth)| (registry.clone(), auth.clone().into()))
            .collect();
        let credentials = (!credentials.is_empty()).then_some(credentials);

        let body = Full::new(Bytes::from(context_data));
        let mut stream = self
            .docker
            .build_image(build_options, credentials, Some(Either::Left(body)));

        let mut image_id = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(BuildError::Cancelled),
                next = stream.next() => next,
            };
            let Some(msg) = next else { break };
            if let Some(id) = self.handle_build_output(msg?, config)? {
                image_id = Some(id);
            }
        }

        let image_id = image_id
            .ok_or_else(|| BuildError::EngineFailed("build did not report an image ID".to_string()))?;

        let resolved = match resolve_base_image(
            &dockerfile_content,
            &options.build_args,
            options.target.as_deref(),
        ) {
            Some(base) => self
                .docker
                .inspect_image(&base)
                .await
                .map(|inspect| inspect.id)
                .map_err(BuildError::from),
            None => Ok(None),
        };
        let from_image = settle_base_image(resolved, options.squash)?;

        tracing::info!("Successfully built: {}", image_id);
        Ok(BuildOutput {
            image_id,
            from_image,
        })
    }
}

/// ベースイメージの解決結果を確定する
///
/// 解決の失敗はスカッシュでベースが必要な場合のみエラーとし、
/// それ以外はベースなしとして続行する。
fn settle_base_image(
    resolved: BuildResult<Option<String>>,
    required: bool,
) -> BuildResult<Option<FromImage>> {
    match resolved {
        Ok(id) => Ok(id.map(FromImage::new)),
        Err(e) if required => Err(e),
        Err(e) => {
            tracing::warn!("Could not resolve base image, continuing without it: {}", e);
            Ok(None)
        }
    }
}

struct Stage {
    name: Option<String>,
    image: String,
}

/// Dockerfile の最終ステージのベースイメージを解決する
///
/// - `target` 指定時はそのステージ、なければ最後のステージ
/// - ベースが前のステージ名ならそのステージをたどる
/// - `scratch` の場合は None
/// - `ARG` のデフォルト値とビルド引数で `$VAR` / `${VAR}` を展開
pub fn resolve_base_image(
    dockerfile: &str,
    build_args: &HashMap<String, String>,
    target: Option<&str>,
) -> Option<String> {
    let mut args: HashMap<String, String> = HashMap::new();
    let mut stages: Vec<Stage> = Vec::new();

    for line in logical_lines(dockerfile) {
        let mut words = line.split_whitespace();
        let Some(instruction) = words.next() else {
            continue;
        };

        match instruction.to_ascii_uppercase().as_str() {
            // FROM より前の ARG のみがベースイメージの展開に使える
            "ARG" if stages.is_empty() => {
                for decl in words {
                    let (key, default) = decl.split_once('=').unwrap_or((decl, ""));
                    let value = build_args
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| default.trim_matches('"').to_string());
                    args.insert(key.to_string(), value);
                }
            }
            "FROM" => {
                let rest: Vec<&str> = words.filter(|w| !w.starts_with("--")).collect();
                let Some(image) = rest.first() else {
                    continue;
                };
                let name = match rest.as_slice() {
                    [_, as_kw, name, ..] if as_kw.eq_ignore_ascii_case("as") => {
                        Some(name.to_lowercase())
                    }
                    _ => None,
                };
                stages.push(Stage {
                    name,
                    image: expand_args(image, &args),
                });
            }
            _ => {}
        }
    }

    let mut index = match target {
        Some(target) => stages
            .iter()
            .position(|s| s.name.as_deref() == Some(&target.to_lowercase()))?,
        None => stages.len().checked_sub(1)?,
    };

    // ステージ参照をたどる（前方のステージのみ）
    loop {
        let image = stages[index].image.to_lowercase();
        match stages[..index]
            .iter()
            .rposition(|s| s.name.as_deref() == Some(image.as_str()))
        {
            Some(parent) => index = parent,
            None => break,
        }
    }

    let image = &stages[index].image;
    if image.eq_ignore_ascii_case("scratch") {
        None
    } else {
        Some(image.clone())
    }
}

/// 行継続（末尾の `\`）を結合し、コメント行を除いた論理行
fn logical_lines(dockerfile: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for raw in dockerfile.lines() {
        let trimmed = raw.trim();
        if trimmed.starts_with('#') {
            continue;
        }
        match trimmed.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head);
                current.push(' ');
            }
            None => {
                current.push_str(trimmed);
                if !current.trim().is_empty() {
                    lines.push(current.trim().to_string());
                }
                current.clear();
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push(current.trim().to_string());
    }
    lines
}

/// `$VAR` / `${VAR}` / `${VAR:-default}` を展開
fn expand_args(value: &str, args: &HashMap<String, String>) -> String {
    let mut result = String::new();
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let expr: String = chars.by_ref().take_while(|&c| c != '}').collect();
            let (name, default) = match expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (expr.as_str(), None),
            };
            match args.get(name).filter(|v| !v.is_empty()) {
                Some(v) => result.push_str(v),
                None => result.push_str(default.unwrap_or("")),
            }
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if let Some(v) = args.get(&name) {
                result.push_str(v);
            }
        }
    }
    result
}
