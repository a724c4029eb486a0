//! `run`: execute a test suite.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::capability::{self, Platform};
use crate::config::{self, EnvConfig};
use crate::enclave::{EnclaveHost, EnclaveManager, NitroHost, ProcessHost, ResourceLedger};
use crate::error::RunnerError;
use crate::filter::OutputPolicy;
use crate::image::{CommandMeasurer, ImageLoader};
use crate::orchestrator::{BatchReport, Orchestrator, TestCase, TestResult};
use crate::suite::Suite;
use crate::toolchain::CargoBuilder;

use super::{report_error, required_tools, EXIT_CONFIG, EXIT_FAILURE, EXIT_OK};

/// Exit code when the run is interrupted with Ctrl+C.
const EXIT_INTERRUPTED: i32 = 130;

/// Parsed `run` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub suite: PathBuf,
    pub names: Vec<String>,
    pub json: bool,
}

impl RunArgs {
    /// Parse the arguments after `run`.
    pub fn parse(args: &[String]) -> Result<Self, RunnerError> {
        let mut suite = None;
        let mut names = Vec::new();
        let mut json = false;
        for arg in args {
            match arg.as_str() {
                "--json" => json = true,
                flag if flag.starts_with("--") => {
                    return Err(RunnerError::Config(format!("unknown run option `{}`", flag)));
                }
                value if suite.is_none() => suite = Some(PathBuf::from(value)),
                name => names.push(name.to_string()),
            }
        }
        let suite = suite.ok_or_else(|| RunnerError::Config("missing suite manifest".into()))?;
        Ok(Self { suite, names, json })
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    passed: bool,
    results: &'a [TestResult],
    not_run: &'a [String],
    error: Option<String>,
}

/// Run the suite named in `args`. Exits 0 only when every selected test passes.
pub async fn run_suite(args: &[String]) -> i32 {
    let args = match RunArgs::parse(args) {
        Ok(a) => a,
        Err(e) => {
            report_error(&e);
            return EXIT_CONFIG;
        }
    };
    let env = config::load();

    let cases = match load_cases(&args, &env) {
        Ok(c) => c,
        Err(e) => return report_error(&e),
    };
    let orchestrator = match build_orchestrator(&env) {
        Ok(o) => o,
        Err(e) => return report_error(&e),
    };

    tracing::info!(suite = %args.suite.display(), tests = cases.len(), platform = %env.platform, "running suite");
    let report = tokio::select! {
        report = orchestrator.run_batch(&cases) => report,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, terminating enclaves...");
            if env.platform == Platform::Enclave {
                if let Err(e) = orchestrator.manager().terminate_all().await {
                    eprintln!("Error: {}", e);
                }
            }
            return EXIT_INTERRUPTED;
        }
    };

    if args.json {
        print_json(&report);
    } else {
        print_report(&report);
    }
    if report.passed() {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

fn load_cases(args: &RunArgs, env: &EnvConfig) -> Result<Vec<TestCase>, RunnerError> {
    let suite = Suite::load(&args.suite)?;
    suite
        .select(&args.names)?
        .into_iter()
        .map(|spec| suite.case(spec, &env.defaults))
        .collect()
}

/// Probe the host and wire collaborators for the configured platform.
pub fn build_orchestrator(env: &EnvConfig) -> Result<Orchestrator, RunnerError> {
    let templates = env.commands.parse()?;
    let tools = required_tools(env.platform, &templates);
    let tool_refs: Vec<&str> = tools.iter().map(String::as_str).collect();
    let profile = capability::probe(env.platform, &tool_refs)?;

    let host: Arc<dyn EnclaveHost> = match env.platform {
        Platform::Local => Arc::new(ProcessHost::new()),
        Platform::Enclave => Arc::new(NitroHost::new(templates.nitro.clone())),
    };
    let builder = Arc::new(CargoBuilder::new(
        templates.build.clone(),
        env.target.clone(),
        env.release,
    ));
    let loader = ImageLoader::new(
        env.target.clone(),
        Arc::new(CommandMeasurer::new(templates.measure.clone())),
    );
    let manager = EnclaveManager::new(
        host,
        ResourceLedger::new(env.resources.clone()),
        env.manager.clone(),
    );
    let policy = OutputPolicy::new(env.platform, env.filter.clone())?;
    let orchestrator_config = env.orchestrator_config(&profile);

    Ok(Orchestrator::new(
        profile,
        builder,
        loader,
        manager,
        policy,
        orchestrator_config,
    ))
}

fn print_report(report: &BatchReport) {
    for result in &report.results {
        if result.passed() {
            println!("PASS {} ({} ms)", result.name, result.duration_ms);
        } else {
            println!(
                "FAIL {} ({} ms): {}",
                result.name,
                result.duration_ms,
                result.diagnostic.as_deref().unwrap_or("failed")
            );
            if !result.captured_stderr.trim().is_empty() {
                println!("  stderr:");
                for line in result.captured_stderr.lines() {
                    println!("    {}", line);
                }
            }
        }
        for warning in &result.warnings {
            println!("  warning: {}", warning);
        }
    }
    for name in &report.not_run {
        println!("SKIP {}", name);
    }

    let passed = report.results.iter().filter(|r| r.passed()).count();
    println!(
        "\n{} passed, {} failed, {} not run",
        passed,
        report.results.len() - passed,
        report.not_run.len()
    );
    if let Some(remediation) = report.error.as_ref().and_then(RunnerError::remediation) {
        println!("hint: {}", remediation);
    }
}

fn print_json(report: &BatchReport) {
    let json = JsonReport {
        passed: report.passed(),
        results: &report.results,
        not_run: &report.not_run,
        error: report.error.as_ref().map(ToString::to_string),
    };
    match serde_json::to_string_pretty(&json) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error: {}", e),
    }
}
