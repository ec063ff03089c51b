use std::path::PathBuf;
use std::time::Duration;

use agentic_rpa::config::AgentConfig;
use agentic_rpa::dom::{ChromeDomAnalyzer, StructuralAnalyzer};
use agentic_rpa::hands::{ChromeSurface, ExecutionSurface, RetryPolicy};
use agentic_rpa::orchestrator::{ActionRequest, ApproachPolicy};
use agentic_rpa::{ExecutorConfig, OpenAiOracle, TaskExecutor};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", about = "Autonomous browser agent", version)]
struct Cli {
    /// Configuration file (defaults to the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a multi-step task starting from a URL
    Run {
        #[arg(long)]
        goal: String,
        #[arg(long)]
        url: String,
        /// Step budget (overrides the config)
        #[arg(long)]
        steps: Option<usize>,
        /// Show the browser window
        #[arg(long)]
        headful: bool,
    },
    /// Show which automation approach would handle a single action
    Analyze {
        #[arg(long)]
        url: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        threshold: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AgentConfig::discover().context("loading config")?,
    };

    match cli.command {
        Command::Run {
            goal,
            url,
            steps,
            headful,
        } => run(&config, &goal, &url, steps, headful).await,
        Command::Analyze {
            url,
            task,
            threshold,
        } => analyze(&config, url, task, threshold).await,
    }
}

async fn run(
    config: &AgentConfig,
    goal: &str,
    url: &str,
    steps: Option<usize>,
    headful: bool,
) -> Result<()> {
    let oracle = OpenAiOracle::from_env(config.oracle.clone())?;
    let surface = ChromeSurface::new(config.browser.clone(), RetryPolicy::from(&config.retry));
    let mut executor = TaskExecutor::new(oracle, surface, ExecutorConfig::from(config));

    let budget = steps.unwrap_or(config.executor.step_budget);
    let headless = config.browser.headless && !headful;
    let result = executor.run_task(goal, url, budget, headless).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn analyze(
    config: &AgentConfig,
    url: String,
    task: String,
    threshold: Option<f64>,
) -> Result<()> {
    let mut surface = ChromeSurface::new(config.browser.clone(), RetryPolicy::from(&config.retry));
    surface.launch(true).await?;
    let browser = surface
        .browser()
        .ok_or_else(|| anyhow!("browser did not start"))?;

    let analyzer = ChromeDomAnalyzer::new(
        browser,
        Duration::from_millis(config.browser.navigation_timeout_ms),
    );
    let analysis = analyzer.analyze(&url).await;
    surface.close().await?;
    let analysis = analysis?;
    info!(?analysis, "page analyzed");

    let request = ActionRequest::new(url, task)
        .with_threshold(threshold.unwrap_or(config.policy.confidence_threshold));
    let selection = ApproachPolicy::new().choose_approach(&request, &analysis);
    println!("{}", serde_json::to_string_pretty(&selection)?);
    Ok(())
}
