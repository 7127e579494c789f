use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

const WEB_CRATE: &str = "extension";
const WASM_OUT_DIR: &str = "static/pkg";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "GPS Beacon task runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the wasm bundle into extension/static/pkg
    Build {
        /// Unoptimized debug build
        #[arg(long)]
        dev: bool,
    },

    /// Build the bundle and run the relay server (serves the page too)
    Relay {
        /// Relay config file
        #[arg(short, long, default_value = "relay-config.toml")]
        config: String,

        /// Skip the wasm build
        #[arg(long)]
        no_build: bool,
    },

    /// Run tests
    Test {
        #[command(subcommand)]
        test_type: Option<TestType>,
    },

    /// Run clippy linter
    Clippy,

    /// Remove the generated wasm bundle
    Clean,
}

#[derive(Subcommand)]
enum TestType {
    /// Core pipeline (unit + end-to-end)
    Core,

    /// Relay server (needs loopback networking)
    Relay,

    /// Smoke-test a running relay
    Health {
        #[arg(default_value = "http://127.0.0.1:3000")]
        url: String,
    },

    /// Run all Rust tests
    Unit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { dev } => build(dev),
        Commands::Relay { config, no_build } => relay(&config, no_build),
        Commands::Test { test_type } => test(test_type),
        Commands::Clippy => clippy(),
        Commands::Clean => clean(),
    }
}

fn build(dev: bool) -> Result<()> {
    println!("🔨 Building wasm bundle ({})...", if dev { "dev" } else { "release" });
    let mut args = vec![
        "build",
        WEB_CRATE,
        "--target",
        "no-modules",
        "--out-dir",
        WASM_OUT_DIR,
        "--no-typescript",
    ];
    args.push(if dev { "--dev" } else { "--release" });
    run_cmd("wasm-pack", &args)?;

    println!("✅ Bundle ready in {}/{}", WEB_CRATE, WASM_OUT_DIR);
    Ok(())
}

fn relay(config: &str, no_build: bool) -> Result<()> {
    if !Path::new(config).exists() {
        anyhow::bail!("Config file not found: {}", config);
    }
    if !no_build {
        build(false)?;
    }

    println!("🚀 Starting relay with {}...", config);
    let status = Command::new("cargo")
        .args(["run", "--release", "-p", "beacon-relay"])
        .env("CONFIG_PATH", config)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("Failed to run: cargo run -p beacon-relay")?;

    if !status.success() {
        anyhow::bail!("Relay exited with {}", status);
    }
    Ok(())
}

fn test(test_type: Option<TestType>) -> Result<()> {
    match test_type {
        Some(TestType::Core) => {
            println!("🧪 Testing beacon-core...");
            run_cmd("cargo", &["test", "-p", "beacon-core"])?;
        }
        Some(TestType::Relay) => {
            println!("🧪 Testing relay server...");
            run_cmd("cargo", &["test", "-p", "beacon-relay"])?;
        }
        Some(TestType::Health { url }) => {
            println!("🧪 Checking relay health at {}...", url);
            run_cmd("curl", &["-sf", &format!("{}/api/health", url)])?;
            println!();
        }
        Some(TestType::Unit) | None => {
            println!("🧪 Running all tests...");
            run_cmd("cargo", &["test", "--workspace"])?;
        }
    }
    Ok(())
}

fn clippy() -> Result<()> {
    println!("🔍 Running clippy on workspace (warnings as errors)...");
    run_cmd(
        "cargo",
        &[
            "clippy",
            "--workspace",
            "--all-targets",
            "--",
            "-D",
            "warnings",
        ],
    )?;

    println!("🔍 Running clippy on the wasm crate for wasm32...");
    run_cmd(
        "cargo",
        &[
            "clippy",
            "-p",
            "gps-beacon-web",
            "--target",
            "wasm32-unknown-unknown",
            "--",
            "-D",
            "warnings",
        ],
    )?;
    Ok(())
}

fn clean() -> Result<()> {
    let pkg = Path::new(WEB_CRATE).join(WASM_OUT_DIR);
    if pkg.exists() {
        println!("🧹 Removing {}...", pkg.display());
        fs::remove_dir_all(&pkg).with_context(|| format!("Failed to remove {}", pkg.display()))?;
    } else {
        println!("Nothing to clean");
    }
    Ok(())
}

// Helper functions
fn run_cmd(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to run: {} {}", program, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", program, args.join(" "));
    }

    Ok(())
}
