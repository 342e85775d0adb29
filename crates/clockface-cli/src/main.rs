use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clockface_core::{scorer, template, EngineConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

mod simulate;

#[derive(Parser)]
#[command(name = "clockface", about = "Clockface face template tooling")]
struct Cli {
    /// Engine config file (TOML). CLOCKFACE_* variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map descriptor distances to similarity percentages
    Similarity {
        #[arg(required = true)]
        distances: Vec<f32>,
    },
    /// Print the calibration curve as a table
    Curve {
        #[arg(long, default_value_t = 0.1)]
        step: f32,
        #[arg(long, default_value_t = 1.4)]
        max: f32,
    },
    /// Compare two stored templates
    Compare { a: PathBuf, b: PathBuf },
    /// Rewrite legacy templates in the versioned format
    Migrate {
        /// JSON object mapping employee id to stored template
        input: PathBuf,
        /// Where to write the result (default: overwrite input)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration
    Config,
    /// Run a session against a synthetic camera and detector
    Simulate {
        #[arg(value_enum, default_value_t = Mode::Both)]
        mode: Mode,
        /// Mean detector quality reported by the synthetic camera
        #[arg(long, default_value_t = 92.0)]
        quality: f32,
        /// Per-component descriptor noise
        #[arg(long, default_value_t = 0.01)]
        jitter: f32,
        /// Verification threshold (default: from config)
        #[arg(long)]
        threshold: Option<u8>,
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Enroll,
    Verify,
    Both,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Commands::Similarity { distances } => {
            for d in distances {
                println!("{d:.4}\t{}%", config.calibration.similarity(d));
            }
        }
        Commands::Curve { step, max } => {
            anyhow::ensure!(step > 0.0, "--step must be positive");
            println!("distance\tsimilarity");
            let mut i = 0u32;
            loop {
                let d = i as f32 * step;
                if d > max + f32::EPSILON {
                    break;
                }
                println!("{d:.2}\t\t{}%", config.calibration.similarity(d));
                i += 1;
            }
        }
        Commands::Compare { a, b } => {
            let da = read_template(&a)?;
            let db = read_template(&b)?;
            let distance = scorer::distance(&da, &db);
            let similarity = config.calibration.similarity(distance);
            println!(
                "{}",
                serde_json::json!({
                    "distance": distance,
                    "similarity": similarity,
                    "passes_default_threshold": similarity >= config.default_threshold,
                })
            );
        }
        Commands::Migrate {
            input,
            output,
            dry_run,
        } => migrate(&input, output.as_deref(), dry_run)?,
        Commands::Config => print!("{}", config.to_toml()?),
        Commands::Simulate {
            mode,
            quality,
            jitter,
            threshold,
            seed,
        } => {
            let options = simulate::Options {
                enroll: mode != Mode::Verify,
                verify: mode != Mode::Enroll,
                quality,
                jitter,
                threshold: threshold.unwrap_or(config.default_threshold),
                seed,
            };
            simulate::run(config, options).await?;
        }
    }

    Ok(())
}

fn read_template(path: &Path) -> Result<clockface_core::Descriptor> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    template::deserialize(&raw).with_context(|| format!("decoding {}", path.display()))
}

fn migrate(input: &Path, output: Option<&Path>, dry_run: bool) -> Result<()> {
    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let mut templates: BTreeMap<String, String> =
        serde_json::from_str(&raw).context("input must be a JSON object of strings")?;

    let mut upgraded = 0usize;
    let mut failed = Vec::new();
    for (employee, stored) in templates.iter_mut() {
        if template::is_canonical(stored) {
            continue;
        }
        match template::migrate(stored) {
            Ok(canonical) => {
                tracing::debug!(employee = %employee, "upgraded legacy template");
                *stored = canonical;
                upgraded += 1;
            }
            Err(e) => {
                tracing::warn!(employee = %employee, error = %e, "template cannot be migrated");
                failed.push(employee.clone());
            }
        }
    }

    println!(
        "{} templates, {upgraded} upgraded, {} unreadable",
        templates.len(),
        failed.len()
    );
    for employee in &failed {
        println!("  needs re-enrollment: {employee}");
    }

    if dry_run || upgraded == 0 {
        return Ok(());
    }

    let target = output.unwrap_or(input);
    let encoded = serde_json::to_string_pretty(&templates)?;
    std::fs::write(target, encoded).with_context(|| format!("writing {}", target.display()))?;
    println!("wrote {}", target.display());
    Ok(())
}
