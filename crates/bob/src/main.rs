mod docker;

use bob_build::{
    ConsoleObserver, Deadline, DockerDaemon, GitFetcher, Pipeline, PipelineError,
    PipelineOptions, validate_tag,
};
use bob_config::{BuildRequest, DEFAULT_USERNAME, GitTransport, RegistryCredentials};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Https,
    Ssh,
    Local,
}

#[derive(Parser, Debug)]
#[command(name = "bob", version)]
#[command(about = "Git のコミットからコンテナイメージをビルドし、レジストリへプッシュする", long_about = None)]
struct Cli {
    /// 取得する Git リポジトリ (例: github.com/example/app)
    #[arg(long = "git-repo", env = "BOB_GIT_REPO")]
    git_repo: String,

    /// チェックアウトするコミット ID（イメージのタグにも使う）
    #[arg(long, env = "BOB_COMMIT")]
    commit: String,

    /// イメージ名（省略時は --git-repo と同じ）
    #[arg(long, env = "BOB_IMAGE")]
    image: Option<String>,

    /// 追加タグ（カンマ区切り）。latest とコミット ID は常に付与される
    #[arg(long, env = "BOB_TAGS")]
    tags: Option<String>,

    /// レジストリのユーザー名
    #[arg(short = 'u', long, env = "BOB_USERNAME", default_value = DEFAULT_USERNAME)]
    username: String,

    /// レジストリのパスワード
    #[arg(
        short = 'p',
        long,
        env = "BOB_PASSWORD",
        default_value = "",
        hide_env_values = true,
        hide_default_value = true
    )]
    password: String,

    /// レジストリのサーバーアドレス
    #[arg(long, alias = "docker-repo", env = "BOB_REGISTRY")]
    registry: Option<String>,

    /// ジョブ全体の制限時間 (例: 90s, 5m, 1h30m)
    #[arg(long, env = "BOB_TIMEOUT", default_value = "5m", value_parser = parse_timeout)]
    timeout: Duration,

    /// ソース取得のトランスポート
    #[arg(long, value_enum, env = "BOB_GIT_TRANSPORT", default_value_t = Transport::Https)]
    git_transport: Transport,

    /// SSH トランスポートで使う秘密鍵
    #[arg(long, env = "BOB_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// レイヤーキャッシュを使わずにビルドする
    #[arg(long, env = "BOB_NO_CACHE")]
    no_cache: bool,

    /// Docker デーモンのアドレス (unix:// または tcp://)
    #[arg(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,

    /// 作成したビルドコンテキストを保存する
    #[arg(long, value_name = "PATH")]
    dump_context: Option<PathBuf>,

    /// デバッグログを出力
    #[arg(short, long)]
    verbose: bool,
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    bob_config::parse_duration(s).map_err(|e| e.to_string())
}

impl Cli {
    fn transport(&self) -> GitTransport {
        match self.git_transport {
            Transport::Https => GitTransport::Https,
            Transport::Ssh => GitTransport::Ssh {
                key: self.ssh_key.clone(),
            },
            Transport::Local => GitTransport::Local,
        }
    }

    fn build_request(&self) -> anyhow::Result<BuildRequest> {
        let tags = bob_config::resolve_tags(self.tags.as_deref(), &self.commit);
        let image = self.image.clone().unwrap_or_else(|| self.git_repo.clone());

        let request = BuildRequest::new(
            self.git_repo.trim(),
            self.commit.trim(),
            image,
            tags,
            self.timeout,
        )?;
        for tag in request.tags() {
            validate_tag(tag)?;
        }
        Ok(request)
    }

    fn credentials(&self) -> RegistryCredentials {
        RegistryCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            server_address: self.registry.clone(),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // 標準出力はビルドログに使うので、ログは標準エラーへ
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let request = cli.build_request()?;

    println!("{}", "コンテナイメージをビルドします".green());
    println!("リポジトリ: {}", request.repository().cyan());
    println!("コミット: {}", request.commit().cyan());
    println!("タグ: {}", request.references().join(", ").cyan());
    println!();

    // Docker への接続確認もジョブの制限時間に含める
    let deadline = Deadline::after(request.timeout());
    tracing::debug!("Job budget: {:?}", request.timeout());

    let docker =
        docker::init_docker_with_error_handling(cli.docker_host.as_deref(), &deadline).await?;

    let pipeline = Pipeline::new(
        Arc::new(GitFetcher::new(cli.transport())),
        Arc::new(DockerDaemon::new(docker)),
        cli.credentials(),
        Arc::new(ConsoleObserver),
    )
    .with_options(PipelineOptions {
        no_cache: cli.no_cache,
        dump_context: cli.dump_context.clone(),
    });

    let report = pipeline.run_with(&request, deadline).await?;

    // 結果サマリー
    println!();
    println!("{}", "結果サマリー:".bold());
    println!("  コミット: {}", report.commit);
    if let Some(id) = &report.image_id {
        println!("  イメージ: {}", id);
    }
    for reference in &report.published {
        println!("  {} {}", "✓".green(), reference.cyan());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = match e.downcast_ref::<PipelineError>() {
                Some(pipeline_error) => pipeline_error.user_message(),
                None => format!("{:#}", e),
            };
            eprintln!("{} {}", "✗".red().bold(), message);
            ExitCode::FAILURE
        }
    }
}
