use bollard::{API_DEFAULT_VERSION, Docker};
use colored::Colorize;

/// 接続タイムアウト（秒）
const CONNECT_TIMEOUT: u64 = 120;

/// 設定に応じて Docker に接続する
///
/// `docker_host` がなければ DOCKER_HOST 環境変数またはローカルのデフォルトを使う。
fn connect(docker_host: Option<&str>) -> Result<Docker, bollard::errors::Error> {
    match docker_host {
        Some(host) if host.starts_with("unix://") => {
            Docker::connect_with_unix(host, CONNECT_TIMEOUT, API_DEFAULT_VERSION)
        }
        Some(host) => Docker::connect_with_http(host, CONNECT_TIMEOUT, API_DEFAULT_VERSION),
        None => Docker::connect_with_local_defaults(),
    }
}

fn print_connection_error(e: &dyn std::fmt::Display) {
    eprintln!();
    eprintln!("{}", "✗ Docker接続エラー".red().bold());
    eprintln!();
    eprintln!("{}", "原因:".yellow());
    eprintln!("  {}", e);
    eprintln!();
    eprintln!("{}", "解決方法:".yellow());
    eprintln!("  • Dockerが起動しているか確認してください");
    eprintln!("  • config.yaml の docker_host が正しいか確認してください");
    eprintln!("  • docker ps コマンドが正常に動作するか確認してください");
}

/// Docker接続を初期化（エラーハンドリング付き）
pub async fn init_docker_with_error_handling(
    docker_host: Option<&str>,
) -> anyhow::Result<Docker> {
    let docker = connect(docker_host).map_err(|e| {
        print_connection_error(&e);
        anyhow::anyhow!("Docker接続に失敗しました")
    })?;

    // 接続テスト
    docker.ping().await.map_err(|e| {
        print_connection_error(&e);
        anyhow::anyhow!("Docker接続に失敗しました")
    })?;

    tracing::debug!("Connected to Docker daemon");
    Ok(docker)
}
