//! Inspect a Wan checkpoint: fingerprint, convention and known architecture
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin inspect_checkpoint -- --path ./Wan2.1-T2V-1.3B
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use candle_recam::{
    loader::{fingerprint_from_info, read_tensor_info, resolve_checkpoint_files},
    weight_format::{Convention, FingerprintRegistry, StateDictConverter, detect_convention},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fingerprint a Wan video DiT checkpoint")]
struct Args {
    /// Safetensors file or checkpoint directory
    #[arg(short, long)]
    path: PathBuf,

    /// Extra fingerprint registry (JSON list), replaces the embedded one
    #[arg(long)]
    registry: Option<PathBuf>,

    /// List keys that have no internal name
    #[arg(long)]
    show_dropped: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_recam=info".parse()?)
                .add_directive("inspect_checkpoint=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let registry = match &args.registry {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading registry {}", path.display()))?;
            FingerprintRegistry::from_json(&json).context("parsing registry")?
        }
        None => FingerprintRegistry::embedded()?,
    };
    let converter = StateDictConverter::new(registry);

    let files = resolve_checkpoint_files(&args.path)?;
    info!("Reading {} file(s) from {}", files.len(), args.path.display());
    let tensors = read_tensor_info(&files)?;

    let fingerprint = fingerprint_from_info(&tensors);
    let convention = detect_convention(tensors.keys().map(String::as_str));
    let config = converter.registry().lookup(convention, &fingerprint);

    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();
    let (converted, dropped): (Vec<&String>, Vec<&String>) = match convention {
        Convention::Diffusers => names
            .into_iter()
            .partition(|n| converter.rename_diffusers_key(n).is_some()),
        Convention::Civitai => (names, Vec::new()),
    };

    println!("tensors:     {}", tensors.len());
    println!("convention:  {convention}");
    println!("fingerprint: {fingerprint}");
    println!("converted:   {}", converted.len());
    println!("dropped:     {}", dropped.len());
    match config {
        Some(cfg) => println!("config:\n{}", serde_json::to_string_pretty(cfg)?),
        None => println!("config:      unknown fingerprint"),
    }
    if args.show_dropped {
        for name in dropped {
            println!("  - {name}");
        }
    }
    Ok(())
}
