//! Stratum CLI - concurrent orchestration core for IaC unit graphs.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use stratum::dag::{SortMode, UnitGraph};
use stratum::discover::{self, parse_filter_query, DiscoveredKind, FilterToken};
use stratum::error::{FixSuggestion, StratumError};
use stratum::exec::{resolve_engine_binary, run_unit_action};
use stratum::hcl::load_unit;
use stratum::log::{Preset, StratumLogLayer};
use stratum::runner::{run_all, FailFastMode};
use stratum::telemetry::{self, TraceExporter};
use stratum::unit::{Action, Unit};
use stratum::StratumConfig;

#[derive(Parser)]
#[command(name = "stratum")]
#[command(about = "Concurrent orchestration core for IaC unit graphs")]
#[command(version)]
struct Cli {
    /// Root directory to discover units from.
    #[arg(long, global = true, default_value = ".")]
    working_dir: Utf8PathBuf,

    /// Disable interactive prompts (assume yes to any confirmation).
    #[arg(long, global = true)]
    non_interactive: bool,

    /// tracing level filter, e.g. "info", "debug", "stratum=trace".
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// bare, pretty, json, key-value.
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[arg(long, global = true)]
    no_color: bool,

    /// Worker pool size; defaults to the number of CPUs.
    #[arg(long, global = true)]
    parallelism: Option<usize>,

    #[arg(long, global = true, conflicts_with = "no_fail_fast")]
    fail_fast: bool,

    #[arg(long, global = true)]
    no_fail_fast: bool,

    /// Filter query: `|`-joined AND tokens, `,`-joined OR queries.
    #[arg(long, global = true)]
    filter: Option<String>,

    #[arg(long = "queue-include-dir", global = true)]
    queue_include_dir: Vec<String>,

    #[arg(long = "queue-exclude-dir", global = true)]
    queue_exclude_dir: Vec<String>,

    #[arg(long = "queue-include-units-reading", global = true)]
    queue_include_units_reading: Vec<String>,

    /// NAME=VALUE, repeatable.
    #[arg(long = "feature", global = true)]
    feature: Vec<String>,

    #[arg(long, global = true)]
    iam_assume_role: Option<String>,

    #[arg(long, global = true)]
    iam_assume_role_web_identity_token: Option<String>,

    #[arg(long, global = true)]
    auth_provider_cmd: Option<String>,

    #[arg(long, global = true)]
    provider_cache: bool,

    #[arg(long, global = true)]
    dependency_fetch_output_from_state: bool,

    #[arg(long, global = true, default_value = "stratum.hcl")]
    root_file_name: String,

    #[arg(long = "strict-control", global = true)]
    strict_control: Vec<String>,

    #[arg(long = "experiment", global = true)]
    experiment: Vec<String>,

    #[arg(long, global = true)]
    tf_path: Option<String>,

    #[arg(long, global = true, default_value_t = stratum::util::DEFAULT_MAX_FOLDERS_TO_CHECK)]
    max_folders_to_check: usize,

    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Orchestrated engine invocation over the discovered unit graph.
    Run {
        /// init, plan, apply, destroy, validate, output, import, state-list, state-rm
        action: String,
        /// Extra arguments passed through to the engine binary.
        #[arg(last = true)]
        engine_args: Vec<String>,
    },

    /// List discovered units (and stacks).
    Find {
        #[arg(long)]
        external: bool,
    },

    /// HCL-level configuration commands.
    Hcl {
        #[command(subcommand)]
        action: HclAction,
    },

    /// Emit the merged, evaluated configuration of a unit.
    Render {
        #[arg(long)]
        json: bool,
    },

    /// Not part of the orchestration core.
    Output,
    /// Not part of the orchestration core.
    Graph,
    /// Not part of the orchestration core.
    Scaffold,
    /// Not part of the orchestration core.
    Catalog,
}

#[derive(Subcommand)]
enum HclAction {
    Validate,
    Format {
        #[arg(long)]
        check: bool,
        #[arg(long)]
        diff: bool,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    init_tracing(&cli);

    let result = dispatch(&cli).await;

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    let config = StratumConfig::load().unwrap_or_default().with_env();

    let preset = cli
        .log_format
        .as_deref()
        .or(config.defaults.log_format.as_deref())
        .and_then(Preset::parse)
        .unwrap_or(Preset::Pretty);

    let env_filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    telemetry::install_propagator();
    let otel_layer = telemetry::build_layer(TraceExporter::from_env());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(StratumLogLayer::new(preset, !cli.no_color))
        .with(otel_layer)
        .init();

    telemetry::inherit_traceparent();
}

async fn dispatch(cli: &Cli) -> Result<(), StratumError> {
    match &cli.command {
        Commands::Run { action, engine_args } => run_cmd(cli, action, engine_args).await,
        Commands::Find { external } => find_cmd(cli, *external).await,
        Commands::Hcl { action } => hcl_cmd(cli, action).await,
        Commands::Render { json } => render_cmd(cli, *json).await,
        Commands::Output | Commands::Graph | Commands::Scaffold | Commands::Catalog => {
            stub_cmd(command_name(&cli.command))
        }
    }
}

fn command_name(cmd: &Commands) -> &'static str {
    match cmd {
        Commands::Output => "output",
        Commands::Graph => "graph",
        Commands::Scaffold => "scaffold",
        Commands::Catalog => "catalog",
        _ => unreachable!(),
    }
}

fn stub_cmd(name: &str) -> Result<(), StratumError> {
    eprintln!(
        "{} `{}` is not part of the orchestration core.",
        "Notice:".yellow().bold(),
        name
    );
    std::process::exit(2);
}

fn parse_action(raw: &str) -> Action {
    match raw {
        "init" => Action::Init,
        "plan" => Action::Plan,
        "apply" => Action::Apply,
        "destroy" => Action::Destroy,
        "validate" => Action::Validate,
        "output" => Action::Output,
        "import" => Action::Import,
        "state-list" => Action::StateList,
        "state-rm" => Action::StateRm,
        _ => Action::Other,
    }
}

/// Discover units under `cli.working_dir`, load each one's merged config,
/// then apply `cli.filter` (comma-separated OR of `|`-joined AND tokens).
async fn discover_and_load(cli: &Cli, best_effort: bool) -> Result<Vec<Unit>, StratumError> {
    let entries = discover::discover(&cli.working_dir, cli.max_folders_to_check)?;

    let queries: Vec<Vec<FilterToken>> = match &cli.filter {
        Some(raw) => raw
            .split(',')
            .map(|q| parse_filter_query(q.trim()))
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    let mut units = Vec::new();
    for entry in entries {
        if entry.kind != DiscoveredKind::Unit {
            continue;
        }
        let config_path = entry.path.join(discover::UNIT_CONFIG_FILENAME);
        let unit = load_unit(&config_path, best_effort).await?;
        if queries.is_empty() || queries.iter().any(|tokens| unit_matches(&unit, tokens)) {
            units.push(unit);
        }
    }
    Ok(units)
}

fn unit_matches(unit: &Unit, tokens: &[FilterToken]) -> bool {
    tokens.iter().all(|token| match token {
        FilterToken::PathGlob { glob, negate } => {
            let matched = globset::Glob::new(glob)
                .ok()
                .map(|g| g.compile_matcher().is_match(unit.path.as_str()))
                .unwrap_or(false);
            matched != *negate
        }
        FilterToken::Name(pattern) => globset::Glob::new(pattern)
            .ok()
            .map(|g| g.compile_matcher().is_match(unit.display_name()))
            .unwrap_or(false),
        FilterToken::Type(_) => true,
        FilterToken::External(want) => unit.external == *want,
    })
}

async fn run_cmd(cli: &Cli, action: &str, engine_args: &[String]) -> Result<(), StratumError> {
    use tracing::Instrument;

    let action = parse_action(action);
    let span = tracing::info_span!(
        "run-all",
        command = %action_argv0(action),
        dir = %cli.working_dir
    );
    run_cmd_inner(cli, action, engine_args).instrument(span).await
}

async fn run_cmd_inner(cli: &Cli, action: Action, engine_args: &[String]) -> Result<(), StratumError> {
    let units = discover_and_load(cli, false).await?;

    let unit_slice: Vec<Unit> = units.clone();
    let graph = UnitGraph::build(&unit_slice);
    graph.detect_cycles()?;

    let map: DashMap<Utf8PathBuf, Unit> = units.into_iter().map(|u| (u.path.clone(), u)).collect();

    let engine_bin = Arc::new(resolve_engine_binary(cli.tf_path.as_deref(), None)?);
    let argv: Vec<String> = std::iter::once(action_argv0(action)).chain(engine_args.iter().cloned()).collect();
    let argv = Arc::new(argv);

    let fail_fast = if cli.no_fail_fast {
        FailFastMode::ContinueOnError
    } else {
        FailFastMode::FailFast
    };

    let parallelism = cli.parallelism.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4));
    let cancel = CancellationToken::new();

    let summary = run_all(&graph, &map, action, parallelism, fail_fast, cancel, {
        let engine_bin = Arc::clone(&engine_bin);
        let argv = Arc::clone(&argv);
        move |unit: Unit, token: CancellationToken| {
            let engine_bin = Arc::clone(&engine_bin);
            let argv = Arc::clone(&argv);
            Box::pin(async move { run_unit_action(&unit, action, &engine_bin, &argv, &unit.path.clone(), &token).await })
        }
    })
    .await;

    println!(
        "{} {} succeeded, {} failed",
        "Summary:".cyan().bold(),
        summary.succeeded_count(),
        summary.failed_count()
    );

    if summary.failed_count() > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn action_argv0(action: Action) -> String {
    match action {
        Action::Init => "init",
        Action::Plan => "plan",
        Action::Apply => "apply",
        Action::Destroy => "destroy",
        Action::Validate => "validate",
        Action::Output => "output",
        Action::Import => "import",
        Action::StateList => "state",
        Action::StateRm => "state",
        Action::Other => "plan",
    }
    .to_string()
}

async fn find_cmd(cli: &Cli, external: bool) -> Result<(), StratumError> {
    let units = discover_and_load(cli, true).await?;
    let graph = UnitGraph::build(&units);

    for unit in &units {
        if external && !graph.is_external(unit.path.as_str()) {
            continue;
        }
        println!("{}", unit.display_name());
    }
    Ok(())
}

async fn hcl_cmd(cli: &Cli, action: &HclAction) -> Result<(), StratumError> {
    match action {
        HclAction::Validate => {
            let units = discover_and_load(cli, false).await?;
            println!("{} {} unit(s) parsed and evaluated cleanly", "OK:".green().bold(), units.len());
            Ok(())
        }
        HclAction::Format { check, diff } => {
            // Reformatting the underlying HCL source is a Non-goal (spec.md
            // §4.1); this surfaces the flag without touching files on disk.
            let _ = (check, diff);
            println!("{} HCL formatting is not implemented by the orchestration core", "Notice:".yellow().bold());
            Ok(())
        }
    }
}

async fn render_cmd(cli: &Cli, json: bool) -> Result<(), StratumError> {
    let config_path = Utf8Path::new(&cli.working_dir).join(discover::UNIT_CONFIG_FILENAME);
    let unit = load_unit(&config_path, true).await?;

    if json {
        let rendered = serde_json::json!({
            "path": unit.path.as_str(),
            "locals": unit.locals.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<serde_json::Map<_, _>>(),
            "inputs": unit.inputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<serde_json::Map<_, _>>(),
            "dependencies": unit.dependencies.iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
            "terraform": unit.terraform.as_ref().map(|tf| serde_json::json!({
                "source": tf.source.as_ref().map(|s| s.as_str()),
                "include_in_copy": tf.include_in_copy,
                "exclude_from_copy": tf.exclude_from_copy,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&rendered).map_err(StratumError::from)?);
    } else {
        println!("{} {}", "Unit:".cyan().bold(), unit.display_name());
        for (k, v) in &unit.inputs {
            println!("  {} = {:?}", k, v);
        }
    }
    Ok(())
}
