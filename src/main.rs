use anyhow::{Context, Result};
use clap::Parser;
use nplusone::cli::{Cli, OutputFormat};
use nplusone::report::{FindingSink, JsonLinesSink, TextSink};
use nplusone::{replay, Finder, FinderConfig};
use std::io::Read;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Config file (or defaults) with the command-line threshold applied on top
fn load_config(args: &Cli) -> Result<FinderConfig> {
    let mut config = match &args.config {
        Some(path) => FinderConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FinderConfig::default(),
    };

    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Read the log from a file, or stdin for '-'
fn read_log(path: &Path) -> Result<(String, String)> {
    if path == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read statement log from stdin")?;
        return Ok(("<stdin>".to_string(), source));
    }

    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read statement log {}", path.display()))?;
    Ok((path.display().to_string(), source))
}

fn output_sink(format: OutputFormat) -> Box<dyn FindingSink> {
    match format {
        OutputFormat::Text => Box::new(TextSink::new(std::io::stdout())),
        OutputFormat::Json => Box::new(JsonLinesSink::new(std::io::stdout())),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let (label, source) = read_log(&args.log)?;

    let finder = Finder::builder()
        .config(config)
        .sink(output_sink(args.format))
        .build()?;

    let summary = replay::replay(&finder, &label, &source);

    eprintln!(
        "Replayed {} statements across {} units of work ({} outside any unit): {} finding(s)",
        summary.statements,
        summary.units,
        summary.orphans,
        summary.findings.len()
    );

    if args.fail_on_findings && !summary.findings.is_empty() {
        std::process::exit(1);
    }

    Ok(())
}
