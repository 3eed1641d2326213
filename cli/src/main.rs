use std::path::{Component, Path, PathBuf};
use std::sync::Once;
use std::time::Instant;

static PERF_TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "dynsite::site=debug,dynsite::meta=debug,dynsite::resolve=info,dynsite_cli=info";

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dynsite_core::{
    DispatchConfig,
    perf::scenarios::{Scenario, ScenarioOutcome, all_scenarios, find_scenario},
};
use serde::Serialize;


#[derive(Debug, Parser)]
#[command(
    name = "dynsite",
    author,
    version,
    about = "Run and inspect adaptive call-site dispatch workloads",
    long_about = None,
    after_help = "Set DYNSITE_TRACE=1 (or a filter such as DYNSITE_TRACE=dynsite::site=trace) to log site transitions."
)]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the built-in dispatch scenarios.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Run one scenario and report the final state of its call sites.
    Run {
        /// Scenario key, see `dynsite list`
        #[arg(value_name = "SCENARIO")]
        scenario: String,
        /// Number of calls to issue (defaults to the scenario's own count)
        #[arg(long)]
        calls: Option<u64>,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective dispatch configuration.
    Config {
        #[command(flatten)]
        tuning: TuningArgs,
        #[arg(long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },
}

#[derive(Debug, Clone, Default, clap::Args)]
struct TuningArgs {
    /// TOML, YAML or JSON file with dispatch settings
    #[arg(long, value_name = "FILE", value_parser = parse_sanitized_path)]
    config: Option<PathBuf>,
    #[arg(long)]
    optimize_threshold: Option<u64>,
    #[arg(long)]
    fallback_threshold: Option<u64>,
    /// Inline cache entries per call site
    #[arg(long)]
    cache_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConfigFormat {
    Toml,
    Json,
}

#[derive(Serialize)]
struct ScenarioListing {
    key: &'static str,
    title: &'static str,
    default_calls: u64,
}

#[derive(Serialize)]
struct RunReport<'a> {
    title: &'static str,
    elapsed_ms: f64,
    config: &'a DispatchConfig,
    #[serde(flatten)]
    outcome: &'a ScenarioOutcome,
}

fn sanitize_path(raw: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(raw);

    for comp in p.components() {
        if matches!(comp, Component::ParentDir) {
            return Err(anyhow::anyhow!(
                "Parent directory components ('..') are not allowed in file paths."
            ));
        }
    }

    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    !(trimmed.eq_ignore_ascii_case("0") || trimmed.eq_ignore_ascii_case("false") || trimmed.eq_ignore_ascii_case("off"))
}

fn filter_expr_from(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("1")
        || trimmed.eq_ignore_ascii_case("true")
        || trimmed.eq_ignore_ascii_case("on")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn maybe_init_perf_tracing() {
    let raw = match std::env::var("DYNSITE_TRACE") {
        Ok(value) => value,
        Err(_) => return,
    };

    if !env_toggle_enabled(&raw) {
        return;
    }

    PERF_TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter_expr = filter_expr_from(&raw).or_else(|| std::env::var("RUST_LOG").ok());

        let builder = fmt().with_writer(std::io::stderr);

        let builder = match filter_expr.and_then(|expr| EnvFilter::try_new(expr).ok()) {
            Some(filter) => builder.with_env_filter(filter),
            None => builder.with_env_filter(DEFAULT_TRACE_FILTER),
        };

        let _ = builder.try_init();
    });
}

/// File (or environment) settings first, then command-line flags on top.
fn effective_config(tuning: &TuningArgs) -> anyhow::Result<DispatchConfig> {
    let mut config = match &tuning.config {
        Some(path) => DispatchConfig::from_file(path)?.with_env_overrides()?,
        None => DispatchConfig::from_env()?,
    };
    if let Some(value) = tuning.optimize_threshold {
        config.optimize_threshold = value;
    }
    if let Some(value) = tuning.fallback_threshold {
        config.fallback_threshold = value;
    }
    if let Some(value) = tuning.cache_size {
        config.cache_capacity = value;
    }
    config.validate()?;
    Ok(config)
}

fn lookup_scenario(key: &str) -> anyhow::Result<Scenario> {
    find_scenario(key).ok_or_else(|| {
        let known: Vec<&str> = all_scenarios().iter().map(|s| s.key()).collect();
        anyhow::anyhow!("unknown scenario '{}' (available: {})", key, known.join(", "))
    })
}

fn print_listing(json: bool) -> anyhow::Result<()> {
    let listing: Vec<ScenarioListing> = all_scenarios()
        .iter()
        .map(|s| ScenarioListing {
            key: s.key(),
            title: s.title(),
            default_calls: s.default_calls(),
        })
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        for item in &listing {
            println!("{:<20} {:>8}  {}", item.key, item.default_calls, item.title);
        }
    }
    Ok(())
}

fn render_outcome(title: &str, elapsed_ms: f64, outcome: &ScenarioOutcome) -> String {
    let mut out = format!(
        "scenario {} ({}): {} calls in {:.3} ms, checksum {}\n",
        outcome.scenario, title, outcome.calls, elapsed_ms, outcome.checksum
    );
    for site in &outcome.sites {
        out.push_str(&format!(
            "  site#{} {} {:<12} {:<11} calls={} hits={} misses={} resolutions={} shapes={} penalty={} freezes={} thaws={}\n",
            site.site,
            site.kind,
            site.name,
            site.state.as_str(),
            site.calls,
            site.hits,
            site.misses,
            site.resolutions,
            site.distinct_shapes,
            site.miss_penalty,
            site.freezes,
            site.thaws
        ));
        for entry in &site.entries {
            out.push_str(&format!(
                "    {}({}) -> {} hits={}{}\n",
                entry.receiver,
                entry.args.join(", "),
                entry.target,
                entry.hits,
                if entry.stale { " stale" } else { "" }
            ));
        }
    }
    let metrics = &outcome.metrics;
    out.push_str(&format!(
        "hit ratio {:.2}%, resolver invocations {} (full {}, memo {}), meta-classes {}\n",
        metrics.hit_ratio() * 100.0,
        metrics.resolver_invocations,
        metrics.full_resolutions,
        metrics.memo_hits,
        metrics.meta_classes
    ));
    out
}

fn run_scenario(key: &str, calls: Option<u64>, tuning: &TuningArgs, json: bool) -> anyhow::Result<()> {
    let scenario = lookup_scenario(key)?;
    let config = effective_config(tuning)?;
    let calls = calls.unwrap_or_else(|| scenario.default_calls());

    let started = Instant::now();
    let outcome = scenario
        .run(&config, calls)
        .with_context(|| format!("scenario '{}' failed", scenario.key()))?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

    if json {
        let report = RunReport {
            title: scenario.title(),
            elapsed_ms,
            config: &config,
            outcome: &outcome,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_outcome(scenario.title(), elapsed_ms, &outcome));
    }
    Ok(())
}

fn print_config(tuning: &TuningArgs, format: ConfigFormat) -> anyhow::Result<()> {
    let config = effective_config(tuning)?;
    match format {
        ConfigFormat::Toml => print!("{}", toml::to_string(&config).context("failed to render config as TOML")?),
        ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    maybe_init_perf_tracing();

    let CliArgs { command } = CliArgs::parse();
    match command {
        Commands::List { json } => print_listing(json),
        Commands::Run {
            scenario,
            calls,
            tuning,
            json,
        } => run_scenario(&scenario, calls, &tuning, json),
        Commands::Config { tuning, format } => print_config(&tuning, format),
    }
}
