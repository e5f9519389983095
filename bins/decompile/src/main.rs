//! Ethereum VM bytecode decompiler cli.

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use tac_core::{Settings, TACGraph, dataflow, export};

#[derive(Parser)]
#[clap(name = "decompile", version)]
#[clap(about = "Decompile EVM bytecode into a three-address control flow graph")]
struct Cli {
    /// Input file holding hex runtime bytecode, or `-` for stdin
    infile: String,

    /// Treat the input as disassembly (`PC OPCODE [=> 0xIMM]` lines)
    /// rather than hex bytecode
    #[clap(short, long)]
    dasm: bool,

    /// Write the decompiled graph here instead of stdout
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// Also write the graph topology as JSON
    #[clap(long)]
    json: Option<PathBuf>,

    /// Also write the graph topology in DOT form
    #[clap(long)]
    dot: Option<PathBuf>,

    /// Read analysis settings from a TOML config file
    #[clap(short = 'C', long)]
    config: Option<PathBuf>,

    /// Override individual settings as NAME=VALUE pairs
    #[clap(short = 's', long = "set", value_name = "NAME=VALUE")]
    overrides: Vec<String>,

    /// Write an analytics report as JSON (enables the analytics setting)
    #[clap(short, long)]
    analytics: Option<PathBuf>,

    /// Extract solidity functions and append a summary to the output
    #[clap(long)]
    extract_functions: bool,

    /// Tag block identifiers with the functions they belong to
    #[clap(long)]
    mark_functions: bool,
}

/// Initialize the logger with a nice formatted output.
fn init_logger() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt::fmt().with_env_filter(filter).with_target(false).init();
}

fn build_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => {
            let src = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Settings::from_toml(&src)?
        }
        None => Settings::default(),
    };

    for pair in &cli.overrides {
        let (name, value) = pair
            .split_once('=')
            .with_context(|| format!("malformed setting override {pair:?}"))?;
        settings.set_from_str(name, value)?;
    }

    if cli.extract_functions {
        settings.extract_functions = true;
    }
    if cli.mark_functions {
        settings.mark_functions = true;
    }
    if cli.analytics.is_some() {
        settings.analytics = true;
    }

    Ok(settings)
}

fn read_input(infile: &str) -> Result<String> {
    if infile == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        fs::read_to_string(infile).with_context(|| format!("failed to read input {infile}"))
    }
}

fn main() -> Result<()> {
    init_logger();

    let cli = Cli::parse();
    let mut settings = build_settings(&cli)?;
    let input = read_input(&cli.infile)?;

    let mut graph = if cli.dasm {
        TACGraph::from_dasm(input.lines(), &settings)?
    } else {
        TACGraph::from_bytecode(&input, &settings)?
    };

    let analytics = dataflow::analyse_graph(&mut graph, &mut settings)?;

    let mut text = export::cfg_to_string(&graph);
    if let Some(functions) = &graph.functions {
        text.push_str("\n\nFunctions:\n\n");
        text.push_str(&functions.describe(&graph));
    }
    match &cli.out {
        Some(path) => {
            fs::write(path, text + "\n")
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Wrote graph to {}.", path.display());
        }
        None => println!("{text}"),
    }

    if let Some(path) = &cli.json {
        fs::write(path, export::cfg_to_json(&graph))?;
    }
    if let Some(path) = &cli.dot {
        fs::write(path, export::cfg_to_dot(&graph))?;
    }
    if let Some(path) = &cli.analytics {
        fs::write(path, serde_json::to_string_pretty(&analytics)?)?;
    }

    Ok(())
}
