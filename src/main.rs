//! Triggr - CI control plane entry point

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use triggr::config::Settings;
use triggr::context::AppContext;
use triggr::dispatch::Dispatcher;
use triggr::github::GithubClient;
use triggr::ingress::{self, IngressState};
use triggr::orchestrator::KubeOrchestrator;
use triggr::reconciler::Reconciler;

/// Triggr - GitHub webhooks in, one pod per task out
#[derive(Parser, Debug)]
#[command(name = "triggr", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// The personal access token to manipulate github
    #[arg(long, env = "GITHUB_ACCESS_TOKEN")]
    github_access_token: String,

    /// The github webhook secret
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET")]
    github_webhook_secret: String,

    /// The name of this application, unique from others
    #[arg(long, env = "GITHUB_STATUS_CONTEXT", default_value = "triggr")]
    github_status_context: String,

    /// GitHub API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = "https://api.github.com")]
    github_api_url: String,

    /// The kubernetes namespace to use
    #[arg(long, env = "K8S_NAMESPACE", default_value = "default")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Verify GitHub connectivity before accepting any work
    let github = GithubClient::new(&cli.github_api_url, &cli.github_access_token)
        .map_err(|e| anyhow::anyhow!("cannot create github client: {}", e))?;
    github
        .zen()
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to github: {}", e))?;
    tracing::info!("github connectivity verified");

    let kube_client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("cannot create kubernetes client: {}", e))?;

    let settings = Settings {
        github_token: cli.github_access_token.clone(),
        status_context: cli.github_status_context.clone(),
        namespace: cli.namespace.clone(),
    };
    let ctx = Arc::new(AppContext::new(
        Arc::new(github),
        Arc::new(KubeOrchestrator::new(kube_client.clone(), &cli.namespace)),
        settings,
    ));

    let shutdown = CancellationToken::new();

    // Reconciler: watches pods and mirrors their fate to GitHub
    let reconciler = Reconciler::new(kube_client, cli.namespace.clone(), Arc::clone(&ctx));
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown.child_token()));

    // Ingress: the webhook endpoint
    let router = ingress::router(Arc::new(IngressState {
        dispatcher: Dispatcher::new(ctx),
        webhook_secret: cli.github_webhook_secret,
    }));
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}: {}", cli.listen, e))?;
    tracing::info!(addr = %cli.listen, "webhook server listening");

    let server_shutdown = shutdown.child_token();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .map_err(|e| tracing::error!(error = %e, "webhook server error"))
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("cannot listen for shutdown signal: {}", e))?;
    tracing::info!("shutting down");
    shutdown.cancel();

    let _ = reconciler_handle.await;
    let _ = server_handle.await;

    tracing::info!("triggr stopped");
    Ok(())
}
