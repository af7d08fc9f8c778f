//! xnufind - ARM64 kernel patch offset finder.
//!
//! Locates the patch sites of a set of known kernel features in a
//! decompressed 64-bit Mach-O kernel image.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use xnufind::{find_patches, map_file, Feature, FinderOptions, KernelImage, PatchReport};

/// Finds kernel patch offsets in a decompressed ARM64 Mach-O kernel.
#[derive(Parser, Debug)]
#[command(name = "xnufind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Runtime slide to apply to every address (hex, e.g., 0x1c00000)
    #[arg(short, long, value_parser = parse_hex, default_value = "0")]
    slide: u64,

    /// Feature to find (repeatable; default: all)
    #[arg(short, long = "feature", value_name = "NAME")]
    features: Vec<Feature>,

    /// Print image information before searching
    #[arg(short, long)]
    info: bool,

    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "1")]
    verbosity: u8,

    /// Path to the decompressed kernel image
    kernel: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    let mut options = FinderOptions::default();
    if !cli.features.is_empty() {
        options.features = cli.features;
    }

    let start = Instant::now();

    let mmap = map_file(&cli.kernel)
        .with_context(|| format!("Failed to open kernel: {}", cli.kernel.display()))?;
    let image = KernelImage::from_slice(&mmap, cli.slide)
        .with_context(|| format!("Failed to load kernel: {}", cli.kernel.display()))?;

    if cli.info {
        print_info(&image);
    }

    let report = find_patches(&image, &options);
    print_report(&report);

    info!(
        "Searched {} features in {:.2}s",
        report.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn parse_hex(s: &str) -> std::result::Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn print_info(image: &KernelImage<'_>) {
    println!("Kernel Image Information");
    println!("========================");
    println!("Type:     {}", image.header.filetype_name());
    println!(
        "CPU:      {}",
        if image.header.is_arm64e() { "arm64e" } else { "arm64" }
    );
    println!("Slide:    {:#x}", image.slide());
    println!("Size:     {:.2} MB", image.as_bytes().len() as f64 / 1024.0 / 1024.0);

    println!("\nSegments:");
    for (i, seg) in image.segments().iter().enumerate() {
        println!(
            "  [{:2}] {:<16} {:#018x} - {:#018x} {}",
            i,
            seg.name,
            seg.base,
            seg.end(),
            if seg.executable { "r-x" } else { "r--" }
        );
    }
    println!();
}

fn print_report(report: &PatchReport) {
    for (feature, result) in &report.entries {
        match result {
            Ok(patch) => println!("{:<16} {}", feature.name(), patch),
            Err(e) => println!("{:<16} not found: {}", feature.name(), e),
        }
    }
}
