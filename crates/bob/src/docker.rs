use bob_build::{Deadline, PipelineError};
use bollard::{API_DEFAULT_VERSION, Docker};
use colored::Colorize;
use std::time::Duration;

/// 接続確立までの待ち時間（秒）
const CONNECT_TIMEOUT: u64 = 120;

const CONNECT_STAGE: &str = "connecting to the image daemon";

fn connect(host: Option<&str>) -> Result<Docker, bollard::errors::Error> {
    match host {
        Some(h) if h.starts_with("unix://") => {
            Docker::connect_with_unix(h, CONNECT_TIMEOUT, API_DEFAULT_VERSION)
        }
        Some(h) => Docker::connect_with_http(h, CONNECT_TIMEOUT, API_DEFAULT_VERSION),
        None => Docker::connect_with_local_defaults(),
    }
}

fn print_connection_help(e: &bollard::errors::Error) {
    eprintln!();
    eprintln!("{}", "✗ Docker接続エラー".red().bold());
    eprintln!();
    eprintln!("{}", "原因:".yellow());
    eprintln!("  {}", e);
    eprintln!();
    eprintln!("{}", "解決方法:".yellow());
    eprintln!("  • Dockerデーモンが起動しているか確認してください");
    eprintln!("  • --docker-host または DOCKER_HOST の値を確認してください");
    eprintln!("  • docker ps コマンドが正常に動作するか確認してください");
}

/// Docker接続を初期化（エラーハンドリング付き）
///
/// 接続確認もジョブの期限内で行います。期限を過ぎていれば接続を試みません。
pub async fn init_docker_with_error_handling(
    host: Option<&str>,
    deadline: &Deadline,
) -> anyhow::Result<Docker> {
    deadline.check(CONNECT_STAGE)?;
    tracing::debug!("Connecting to Docker: {}", host.unwrap_or("local defaults"));

    let docker = match connect(host) {
        Ok(docker) => docker,
        Err(e) => {
            print_connection_help(&e);
            return Err(anyhow::anyhow!("Docker接続に失敗しました"));
        }
    };

    // 接続テスト
    match tokio::time::timeout_at(deadline.instant(), docker.ping()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            print_connection_help(&e);
            return Err(anyhow::anyhow!("Docker接続に失敗しました"));
        }
        Err(_) => {
            return Err(PipelineError::DeadlineExceeded {
                stage: CONNECT_STAGE.to_string(),
            }
            .into());
        }
    }

    // 打ち切りはパイプラインの期限に任せる
    let timeout = deadline
        .remaining()
        .max(Duration::from_secs(CONNECT_TIMEOUT));
    Ok(docker.with_timeout(timeout))
}
