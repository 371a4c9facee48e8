//! ollama-auth-proxy e2e test runner
//!
//! Default (no args): finds the proxy binary, spawns it against the mock
//! backend, waits for its ping to report the models preloaded, runs all
//! tests, then kills it.
//!
//!   cargo run                          # auto-detect proxy binary, run all tests
//!   cargo run -- list                  # list all tests
//!   cargo run -- run                   # connect to already-running proxy
//!   cargo run -- spawn-and-run [opts]  # explicit paths / ports

mod backend;
mod client;
mod runner;
mod tests;
mod types;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use runner::{list_tests, run_tests, TestContext};
use tests::all_tests;
use tokio::process::{Child, Command as ProcessCommand};

/// Default proxy binary candidates, tried in order
const DEFAULT_PROXY_BINS: &[&str] = &[
    "../target/release/ollama-auth-proxy",
    "../target/debug/ollama-auth-proxy",
];

const DEFAULT_PROXY_CONFIG: &str = "test_configs/proxy.yaml";
const DEFAULT_BACKEND_PORT: u16 = 18080;
const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:18434";
/// First key listed in the default proxy config
const DEFAULT_API_KEY: &str = "e2e-key-1";

/// Proxy settings that would leak in from the caller's shell and override the test config
const SCRUBBED_ENV: &[&str] = &[
    "OLLAMA_HOST",
    "AUTHORIZATION_HOST",
    "AUTHORIZATION_PORT",
    "AUTHORIZATION_PATH",
    "AUTHORIZATION_PING_HOST",
    "AUTHORIZATION_PING_PORT",
    "AUTHORIZATION_PRELOAD_MODELS",
    "AUTHORIZATION_METRICS_WEBHOOK_URL",
    "AUTHORIZATION_METRICS_WEBHOOK_APIKEY",
];

#[derive(Parser)]
#[command(
    name = "e2e",
    about = "End-to-end tests for ollama-auth-proxy",
    long_about = "Runs all e2e tests by default (no arguments needed).\n\
                  Spawns the proxy binary against a mock Ollama backend, runs tests, then kills it."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Only run tests whose name contains this string
    #[arg(long, short, global = true)]
    filter: Option<String>,
}

/// Where the proxy listens and how to talk to it
#[derive(Args, Clone)]
struct Target {
    /// Proxy address - must match the config
    #[arg(long, default_value = DEFAULT_PROXY_ADDR)]
    proxy_addr: String,

    /// API key the proxy accepts
    #[arg(long, default_value = DEFAULT_API_KEY)]
    api_key: String,

    /// Mock backend port - the proxy's upstream and webhook must point here
    #[arg(long, default_value_t = DEFAULT_BACKEND_PORT)]
    backend_port: u16,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            proxy_addr: DEFAULT_PROXY_ADDR.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            backend_port: DEFAULT_BACKEND_PORT,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Connect to an already-running proxy and run tests
    Run {
        #[command(flatten)]
        target: Target,
    },

    /// List all available tests
    List,

    /// Spawn the proxy binary, run all tests, then kill it
    SpawnAndRun {
        /// Path to the ollama-auth-proxy binary
        #[arg(long)]
        proxy_bin: Option<String>,

        /// Path to the proxy config YAML
        #[arg(long, default_value = DEFAULT_PROXY_CONFIG)]
        proxy_config: String,

        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = cli.filter;

    let results = match cli.command {
        None => {
            let proxy_bin = find_proxy_bin()?;
            spawn_and_run(&proxy_bin, DEFAULT_PROXY_CONFIG, Target::default(), filter.as_deref()).await?
        }
        Some(Command::List) => {
            list_tests(&all_tests());
            return Ok(());
        }
        Some(Command::Run { target }) => {
            let ctx = prepare(&target).await?;
            run_tests(all_tests(), ctx, filter.as_deref()).await
        }
        Some(Command::SpawnAndRun {
            proxy_bin,
            proxy_config,
            target,
        }) => {
            let proxy_bin = match proxy_bin {
                Some(p) => p,
                None => find_proxy_bin()?,
            };
            spawn_and_run(&proxy_bin, &proxy_config, target, filter.as_deref()).await?
        }
    };

    if results.iter().any(|r| !r.passed) {
        std::process::exit(1);
    }
    Ok(())
}

/// Start the mock backend and wait for the proxy to report ready
async fn prepare(target: &Target) -> anyhow::Result<TestContext> {
    println!("Starting mock backend on port {}...", target.backend_port);
    let backend_state = backend::start(target.backend_port).await?;
    println!("Mock backend running on 127.0.0.1:{}", target.backend_port);

    println!("Waiting for proxy at {}...", target.proxy_addr);
    wait_for_proxy(&target.proxy_addr, &target.api_key).await?;
    println!("Proxy is ready!\n");

    Ok(TestContext {
        proxy_addr: target.proxy_addr.clone(),
        api_key: target.api_key.clone(),
        backend_state,
        http_client: client::build_client(),
    })
}

async fn spawn_and_run(
    proxy_bin: &str,
    proxy_config: &str,
    target: Target,
    filter: Option<&str>,
) -> anyhow::Result<Vec<types::TestResult>> {
    // The mock is started inside `prepare`, after the spawn; the proxy keeps
    // probing until it answers, which also exercises the wait-for-upstream path
    let mut proxy = spawn_proxy(proxy_bin, proxy_config)?;

    let ctx = match prepare(&target).await {
        Ok(ctx) => ctx,
        Err(e) => {
            proxy.kill().await.ok();
            return Err(e);
        }
    };
    let results = run_tests(all_tests(), ctx, filter).await;

    proxy.kill().await.ok();
    Ok(results)
}

fn spawn_proxy(proxy_bin: &str, proxy_config: &str) -> anyhow::Result<Child> {
    println!("Spawning proxy: {} run --config {}", proxy_bin, proxy_config);
    let mut command = ProcessCommand::new(proxy_bin);
    command.arg("run").arg("--config").arg(proxy_config).kill_on_drop(true);
    for var in SCRUBBED_ENV {
        command.env_remove(var);
    }
    command
        .spawn()
        .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", proxy_bin, e))
}

/// Find the proxy binary, trying release then debug builds
fn find_proxy_bin() -> anyhow::Result<String> {
    DEFAULT_PROXY_BINS
        .iter()
        .find(|candidate| std::path::Path::new(candidate).exists())
        .map(|candidate| {
            println!("Using proxy binary: {}", candidate.bright_cyan());
            candidate.to_string()
        })
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No proxy binary found. Tried: {}\nBuild with: cd .. && cargo build --release",
                DEFAULT_PROXY_BINS.join(", ")
            )
        })
}

/// Poll the ping until it answers 200, i.e. every configured model was pulled
async fn wait_for_proxy(addr: &str, api_key: &str) -> anyhow::Result<()> {
    let client = client::build_client();

    let mut last_status = None;
    for attempt in 0..30 {
        tokio::time::sleep(tokio::time::Duration::from_millis(200 + attempt * 100)).await;
        match client::send_get(&client, addr, "/ping", Some(&client::bearer(api_key))).await {
            Ok(resp) if resp.status == 200 => return Ok(()),
            Ok(resp) => last_status = Some(resp.status),
            Err(_) => {}
        }
    }

    Err(anyhow::anyhow!(
        "Proxy at {} did not become ready in time (last ping status: {:?})",
        addr,
        last_status
    ))
}
