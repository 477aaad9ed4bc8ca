//! BuildFlow のイメージビルド機能
//!
//! ビルドエンジンの実行後に行う仕上げ処理（スカッシュ・タグ付け・プッシュ）の
//! オーケストレーションと、Docker Engine を使ったその実装を提供します。

pub mod auth;
pub mod backend;
pub mod component;
pub mod context;
pub mod docker;
pub mod engine;
pub mod error;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod tagger;

pub use auth::{AuthConfig, RegistryAuth, resolve_auth_config};
pub use backend::{Backend, squash_build};
pub use component::{ImageComponent, ImageId};
pub use context::ContextBuilder;
pub use docker::{DockerBuildEngine, DockerImageComponent, split_image_tag};
pub use engine::{BuildConfig, BuildEngine, BuildOptions, BuildOutput, FromImage};
pub use error::{BuildError, BuildFailure, BuildResult};
pub use progress::{OutputBuffer, ProgressEvent, ProgressOutput, ProgressWriter, StdoutFormatter};
pub use reference::{Named, parse_normalized_named, truncate_id};
pub use registry::{DefaultRegistryService, IndexInfo, RegistryService, RepositoryInfo, ServiceOptions};
pub use tagger::Tagger;
