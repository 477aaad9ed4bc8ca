use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "BUILDFLOW_CONFIG_PATH で指定された設定ファイルが見つかりません: {0}\n\
        環境変数を削除すると以下の場所を順に検索します:\n\
        - ./.buildflow/config.yaml\n\
        - ~/.config/buildflow/config.yaml"
    )]
    ConfigFileNotFound(PathBuf),

    #[error("設定ファイルの解析に失敗しました ({path}): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
