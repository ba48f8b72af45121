use anyhow::{Context, Result};
use clap::Parser;
use nnfuse::config::QuantizationConfig;
use nnfuse::matches::{get_fusion, get_fusions};
use nnfuse::quantization::{HandlerRegistry, Quantizer, StatsTable};
use nnfuse::Network;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nnfuse", about = "Fuse and quantize a neural network graph")]
struct Cli {
    /// Network graph as JSON.
    #[arg(required_unless_present = "list_fusions")]
    graph: Option<PathBuf>,

    /// Calibration statistics as JSON.
    #[arg(long, required_unless_present = "list_fusions")]
    stats: Option<PathBuf>,

    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the result here instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Run only this pass or match group after quantization.
    #[arg(long)]
    fusion: Option<String>,

    /// List the available passes and handler options, then exit.
    #[arg(long)]
    list_fusions: bool,
}

fn read(path: &PathBuf) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if cli.list_fusions {
        for (name, description) in get_fusions() {
            println!("{name:<32} {description}");
        }
        println!("\noptions:");
        for (name, option) in HandlerRegistry::standard().declared_options() {
            println!("{name:<32} {} (default {})", option.help, option.default);
        }
        return Ok(());
    }
    let (Some(graph), Some(stats)) = (&cli.graph, &cli.stats) else {
        anyhow::bail!("a graph and statistics are required");
    };

    let mut network = Network::from_json(&read(graph)?).context("loading network")?;
    let stats = StatsTable::from_json(&read(stats)?).context("loading statistics")?;
    let config = match &cli.config {
        Some(path) => QuantizationConfig::from_json(&read(path)?).context("loading config")?,
        None => QuantizationConfig::default(),
    };
    let registry = HandlerRegistry::standard();

    let report = match &cli.fusion {
        Some(name) => {
            let matcher = get_fusion(name)?;
            let quantizer = Quantizer::new(&registry, &stats, &config);
            network.apply(matcher.as_ref(), Some(&quantizer))?;
            network.verify()?;
            None
        }
        None => network.prepare(&stats, &config, &registry)?,
    };

    let table = network.quantization.as_ref().context("network was not quantized")?;
    let fused: Vec<_> = network
        .fused_nodes()?
        .into_iter()
        .map(|(name, kind)| json!({ "name": name, "kind": kind }))
        .collect();
    let result = json!({
        "quantization": table,
        "fused": fused,
        "equalization": report,
    });
    let text = serde_json::to_string_pretty(&result)?;
    match &cli.output {
        Some(path) => fs::write(path, text).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{text}"),
    }
    Ok(())
}
