use crate::docker;
use anyhow::Context;
use buildflow_build::{
    Backend, BuildConfig, BuildError, BuildOptions, DefaultRegistryService, DockerBuildEngine,
    DockerImageComponent, ProgressWriter, RegistryAuth, ServiceOptions, truncate_id,
};
use buildflow_config::DaemonConfig;
use colored::Colorize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// `bflow build` の引数
pub struct BuildArgs {
    pub context: PathBuf,
    pub file: Option<PathBuf>,
    pub tags: Vec<String>,
    pub push_as: Option<String>,
    pub squash: bool,
    pub build_args: Vec<String>,
    pub target: Option<String>,
    pub no_cache: bool,
    pub pull: bool,
    pub labels: Vec<String>,
    pub json: bool,
}

/// `KEY=VALUE` 形式の引数をパース
///
/// `=` を含まない場合は同名の環境変数の値を使う（docker build と同じ）。
pub fn parse_key_values(values: &[String], flag: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for value in values {
        match value.split_once('=') {
            Some((key, _)) if key.is_empty() => {
                anyhow::bail!("{} の形式が不正です: '{}' (KEY=VALUE)", flag, value);
            }
            Some((key, val)) => {
                map.insert(key.to_string(), val.to_string());
            }
            None => {
                let val = std::env::var(value).with_context(|| {
                    format!("{} '{}' に値がなく、同名の環境変数もありません", flag, value)
                })?;
                map.insert(value.clone(), val);
            }
        }
    }
    Ok(map)
}

fn load_auth_configs(config: &DaemonConfig) -> HashMap<String, buildflow_build::AuthConfig> {
    let auth = match &config.docker_config {
        Some(dir) => RegistryAuth::with_config_path(dir.join("config.json")),
        None => RegistryAuth::new(),
    };
    match auth.load_auth_configs() {
        Ok(configs) => configs,
        Err(e) => {
            tracing::warn!("認証情報の読み込みに失敗しました（認証なしで続行）: {}", e);
            HashMap::new()
        }
    }
}

fn print_error(error: &BuildError) {
    eprintln!();
    eprintln!("{} {}", "✗".red().bold(), error.user_message());
}

pub async fn handle_build_command(args: BuildArgs, config: DaemonConfig) -> anyhow::Result<()> {
    if !args.context.is_dir() {
        let error = BuildError::ContextNotFound(args.context.clone());
        print_error(&error);
        return Err(error.into());
    }

    let build_args = parse_key_values(&args.build_args, "--build-arg")?;
    let labels = parse_key_values(&args.labels, "--label")?;

    let options = BuildOptions {
        tags: args.tags,
        push_as: args.push_as.unwrap_or_default(),
        squash: args.squash,
        auth_configs: load_auth_configs(&config),
        context_dir: args.context,
        dockerfile: args.file,
        build_args,
        target: args.target,
        no_cache: args.no_cache,
        pull: args.pull,
        labels,
    };
    tracing::debug!(
        "Build options: tags={:?}, push_as={:?}, squash={}",
        options.tags,
        options.push_as,
        options.squash
    );

    let docker = docker::init_docker_with_error_handling(config.docker_host.as_deref()).await?;
    let registry_service = DefaultRegistryService::new(ServiceOptions {
        insecure_registries: config.insecure_registries.clone(),
        mirrors: config.registry_mirrors.clone(),
    });
    let backend = Backend::new(
        Arc::new(DockerImageComponent::new(docker.clone())),
        Arc::new(DockerBuildEngine::new(docker)),
        Arc::new(registry_service),
    );

    // Ctrl-C でビルドをキャンセル
    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Cancelling build");
            ctrl_c_token.cancel();
        }
    });

    let build_config = BuildConfig {
        options,
        progress: ProgressWriter::stdout(args.json),
    };

    match backend.build(&cancel, &build_config).await {
        Ok(image_id) => {
            if args.json {
                println!("{}", serde_json::json!({ "aux": { "ID": image_id } }));
            } else {
                println!("{} {}", "✓".green().bold(), truncate_id(&image_id));
            }
            Ok(())
        }
        Err(failure) => {
            print_error(&failure.error);
            // タグ付け・プッシュの失敗でもイメージ自体は存在する
            if let Some(image_id) = &failure.image_id {
                eprintln!("  {} {}", "イメージID:".yellow(), image_id);
            }
            Err(failure.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_key_values() {
        let map = parse_key_values(&strings(&["A=1", "B=x=y", "C="]), "--build-arg").unwrap();
        assert_eq!(map.get("A").map(String::as_str), Some("1"));
        assert_eq!(map.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(map.get("C").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_key_values_empty_key() {
        assert!(parse_key_values(&strings(&["=1"]), "--label").is_err());
    }

    #[test]
    fn test_parse_key_values_missing_env() {
        let result = parse_key_values(&strings(&["BUILDFLOW_TEST_SURELY_UNSET_VAR"]), "--build-arg");
        assert!(result.is_err());
    }
}
