//! Test runner - executes registered cases against the proxy and reports results

use colored::Colorize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use crate::types::{SharedBackendState, TestResult};

type TestFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A single test case
pub struct TestCase {
    /// `category/name`; the category groups the summary
    pub name: &'static str,
    pub description: &'static str,
    pub run: Box<dyn Fn(TestContext) -> TestFuture + Send + Sync>,
}

impl TestCase {
    fn category(&self) -> &'static str {
        self.name.split('/').next().unwrap_or(self.name)
    }
}

/// Context passed to each test - proxy address, the key it accepts, and backend state
#[derive(Clone)]
pub struct TestContext {
    pub proxy_addr: String,
    pub api_key: String,
    pub backend_state: SharedBackendState,
    pub http_client: reqwest::Client,
}

impl TestContext {
    /// Authorization header value carrying the configured key
    pub fn auth(&self) -> String {
        crate::client::bearer(&self.api_key)
    }

    /// Forget queued responses, recorded requests and webhook events
    ///
    /// Pulls are kept: they only happen once, at proxy startup.
    fn reset_backend(&self) {
        let mut state = self.backend_state.lock().unwrap();
        state.response_queue.clear();
        state.received_requests.clear();
        state.webhook_events.clear();
    }
}

const RULE: &str = "═══════════════════════════════════════════════════";
const THIN_RULE: &str = "───────────────────────────────────────────────────";

/// Run the selected test cases one after another and report results
pub async fn run_tests(cases: Vec<TestCase>, ctx: TestContext, filter: Option<&str>) -> Vec<TestResult> {
    let selected: Vec<&TestCase> = cases
        .iter()
        .filter(|c| filter.map_or(true, |f| c.name.contains(f)))
        .collect();

    println!("\n{}", RULE.bright_blue());
    println!("{}", "  ollama-auth-proxy End-to-End Tests".bright_white().bold());
    println!("{}", RULE.bright_blue());
    println!("  Proxy:   {}", ctx.proxy_addr.bright_cyan());
    println!("  API key: {}", ctx.api_key.bright_cyan());
    println!("  Running: {} test(s)\n", selected.len().to_string().bright_cyan());

    let mut results = Vec::with_capacity(selected.len());
    let mut per_category: BTreeMap<&str, (usize, usize)> = BTreeMap::new();

    for case in selected {
        ctx.reset_backend();

        print!("  {} {} ... ", "▶".bright_blue(), case.name.bright_white());
        let start = Instant::now();
        let outcome = (case.run)(ctx.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let tally = per_category.entry(case.category()).or_default();
        let error = match outcome {
            Ok(()) => {
                println!("{} ({duration_ms}ms)", "PASS".bright_green().bold());
                tally.0 += 1;
                None
            }
            Err(e) => {
                println!("{} ({duration_ms}ms)", "FAIL".bright_red().bold());
                println!("    {} {}", "Error:".bright_red(), e);
                for cause in e.chain().skip(1) {
                    println!("    {} {}", "Caused by:".yellow(), cause);
                }
                tally.1 += 1;
                Some(e.to_string())
            }
        };

        results.push(TestResult {
            name: case.name.to_string(),
            passed: error.is_none(),
            error,
            duration_ms,
        });
    }

    print_summary(&results, &per_category);
    results
}

fn print_summary(results: &[TestResult], per_category: &BTreeMap<&str, (usize, usize)>) {
    println!("\n{}", THIN_RULE.bright_blue());
    for (category, (passed, failed)) in per_category {
        let line = format!("  {:<12} {} passed, {} failed", category, passed, failed);
        if *failed == 0 {
            println!("{}", line.green());
        } else {
            println!("{}", line.red());
        }
    }

    let failures: Vec<&TestResult> = results.iter().filter(|r| !r.passed).collect();
    if !failures.is_empty() {
        println!("\n  {}", "Failed:".bright_red().bold());
        for failure in &failures {
            println!("    - {}", failure.name);
        }
    }

    let summary = format!(
        "\n  Results: {} passed, {} failed",
        results.len() - failures.len(),
        failures.len()
    );
    if failures.is_empty() {
        println!("{}", summary.bright_green().bold());
    } else {
        println!("{}", summary.bright_red().bold());
    }
    println!("{}\n", RULE.bright_blue());
}

/// Print every registered test, grouped by category
pub fn list_tests(cases: &[TestCase]) {
    println!("\n{}", "Available tests:".bright_white().bold());
    let mut current = "";
    for case in cases {
        if case.category() != current {
            current = case.category();
            println!("\n  {}", current.bright_white().bold());
        }
        println!("    {} - {}", case.name.bright_cyan(), case.description);
    }
    println!();
}
