mod build;
mod docker;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bflow")]
#[command(about = "コンテナイメージをビルドし、スカッシュ・タグ付け・プッシュまで行う", long_about = None)]
struct Cli {
    /// 詳細なログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// イメージをビルド
    Build {
        /// ビルドコンテキストのディレクトリ
        #[arg(default_value = ".")]
        context: PathBuf,
        /// Dockerfile のパス（デフォルト: CONTEXT/Dockerfile）
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// ビルド後に付与するタグ（複数指定可）
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// ビルド後にこの参照でタグ付けしてプッシュする
        #[arg(long)]
        push_as: Option<String>,
        /// ベースイメージ以降のレイヤーを1つにまとめる
        #[arg(long)]
        squash: bool,
        /// ビルド引数 (KEY=VALUE)
        #[arg(long = "build-arg")]
        build_args: Vec<String>,
        /// マルチステージビルドのターゲットステージ
        #[arg(long)]
        target: Option<String>,
        /// キャッシュを使わずにビルド
        #[arg(long)]
        no_cache: bool,
        /// ベースイメージを常に pull する
        #[arg(long)]
        pull: bool,
        /// イメージのラベル (KEY=VALUE)
        #[arg(long = "label")]
        labels: Vec<String>,
        /// 出力を JSON 行で出力
        #[arg(long)]
        json: bool,
    },
    /// バージョン情報を表示
    Version,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,buildflow={0},buildflow_build={0},buildflow_config={0}",
            default_level
        ))
    });

    // stdout はビルド出力に使うためログは stderr へ
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Version => {
            println!("buildflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Build {
            context,
            file,
            tags,
            push_as,
            squash,
            build_args,
            target,
            no_cache,
            pull,
            labels,
            json,
        } => {
            let config = buildflow_config::load_config().map_err(|e| {
                eprintln!("{} {}", "✗".red().bold(), e);
                anyhow::anyhow!("設定の読み込みに失敗しました")
            })?;

            build::handle_build_command(
                build::BuildArgs {
                    context,
                    file,
                    tags,
                    push_as,
                    squash,
                    build_args,
                    target,
                    no_cache,
                    pull,
                    labels,
                    json,
                },
                config,
            )
            .await
        }
    }
}
