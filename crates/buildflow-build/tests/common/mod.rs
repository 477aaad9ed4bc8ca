use async_trait::async_trait;
use buildflow_build::{
    AuthConfig, BuildConfig, BuildEngine, BuildError, BuildOptions, BuildOutput, BuildResult,
    DefaultRegistryService, FromImage, ImageComponent, ImageId, Named, OutputBuffer,
    ProgressOutput, ProgressWriter, RegistryService, RepositoryInfo, ServiceOptions,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// テストダブルに対する呼び出しの記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Build,
    Squash { to: String, from: String },
    Tag { image_id: String, reference: String },
    Resolve { name: String },
    Push { image: String, tag: String, auth: AuthConfig },
}

/// 操作ごとに注入するエラー
#[derive(Default)]
pub struct Failures {
    pub engine: Option<fn() -> BuildError>,
    pub squash: Option<fn() -> BuildError>,
    /// 失敗させる参照（完全な形式）
    pub tag: Vec<String>,
    pub resolve: Option<fn() -> BuildError>,
    pub push: Option<fn() -> BuildError>,
}

/// ビルドエンジン・イメージ操作・レジストリ解決をまとめて記録するテストダブル
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    pub output: BuildOutput,
    pub squashed_id: String,
    pub failures: Failures,
    registry: DefaultRegistryService,
}

#[allow(dead_code)]
impl Recorder {
    pub fn new(image_id: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            output: BuildOutput {
                image_id: image_id.to_string(),
                from_image: None,
            },
            squashed_id: String::new(),
            failures: Failures::default(),
            registry: DefaultRegistryService::new(ServiceOptions::default()),
        }
    }

    pub fn with_base(mut self, base: &str) -> Self {
        self.output.from_image = Some(FromImage::new(base));
        self
    }

    pub fn with_squashed(mut self, squashed_id: &str) -> Self {
        self.squashed_id = squashed_id.to_string();
        self
    }

    pub fn with_failures(mut self, failures: Failures) -> Self {
        self.failures = failures;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Tag { image_id, reference } => Some((image_id, reference)),
                _ => None,
            })
            .collect()
    }

    pub fn pushes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Push { .. }))
            .collect()
    }

    pub fn squashes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Squash { .. }))
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BuildEngine for Recorder {
    async fn build(&self, _cancel: &CancellationToken, _config: &BuildConfig) -> BuildResult<BuildOutput> {
        self.record(Call::Build);
        match self.failures.engine {
            Some(err) => Err(err()),
            None => Ok(self.output.clone()),
        }
    }
}

#[async_trait]
impl ImageComponent for Recorder {
    async fn squash_image(&self, to: &str, from: &str) -> BuildResult<String> {
        self.record(Call::Squash {
            to: to.to_string(),
            from: from.to_string(),
        });
        match self.failures.squash {
            Some(err) => Err(err()),
            None => Ok(self.squashed_id.clone()),
        }
    }

    async fn tag_image(&self, image_id: &ImageId, reference: &Named) -> BuildResult<()> {
        let reference = reference.to_string();
        self.record(Call::Tag {
            image_id: image_id.to_string(),
            reference: reference.clone(),
        });
        if self.failures.tag.contains(&reference) {
            return Err(BuildError::TagFailed {
                reference,
                message: "tag rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn push_image(
        &self,
        _cancel: &CancellationToken,
        image: &str,
        tag: &str,
        _meta_headers: &HashMap<String, Vec<String>>,
        auth_config: &AuthConfig,
        _output: ProgressOutput,
    ) -> BuildResult<()> {
        self.record(Call::Push {
            image: image.to_string(),
            tag: tag.to_string(),
            auth: auth_config.clone(),
        });
        match self.failures.push {
            Some(err) => Err(err()),
            None => Ok(()),
        }
    }
}

impl RegistryService for Recorder {
    fn resolve_repository(&self, name: &Named) -> BuildResult<RepositoryInfo> {
        self.record(Call::Resolve {
            name: name.to_string(),
        });
        match self.failures.resolve {
            Some(err) => Err(err()),
            None => self.registry.resolve_repository(name),
        }
    }
}

/// テスト用のビルド設定と出力バッファ
#[allow(dead_code)]
pub fn build_config(tags: &[&str], push_as: &str, squash: bool) -> (BuildConfig, OutputBuffer) {
    let (progress, buffer) = ProgressWriter::buffer(false);
    let config = BuildConfig {
        options: BuildOptions {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            push_as: push_as.to_string(),
            squash,
            ..Default::default()
        },
        progress,
    };
    (config, buffer)
}

/// 1つのテストダブルを3つの協調コンポーネントとして組み込む
#[allow(dead_code)]
pub fn backend(recorder: &Arc<Recorder>) -> buildflow_build::Backend {
    buildflow_build::Backend::new(recorder.clone(), recorder.clone(), recorder.clone())
}
