/// Check every published instrument directory for internal consistency.
///
/// Usage:
///   cargo run --release --bin verify_partitions <output_dir>
use std::env;
use std::path::Path;

use anyhow::Context;
use deribit_options_parser::integrity::verify_output_dir;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <output_dir>", args[0]);
        std::process::exit(1);
    }
    let root = Path::new(&args[1]);
    if !root.is_dir() {
        eprintln!("Output directory does not exist: {}", root.display());
        std::process::exit(1);
    }

    let report = verify_output_dir(root)
        .with_context(|| format!("failed to list {}", root.display()))?;

    let bad: Vec<_> = report.inconsistent().collect();
    for check in &bad {
        println!("FAILURE: {}", check.dir.display());
        for problem in &check.problems {
            println!("  {}", problem);
        }
    }

    println!(
        "\nChecked {} instruments ({} trades), {} inconsistent",
        report.checks.len(),
        report.total_rows(),
        bad.len()
    );
    if !bad.is_empty() {
        std::process::exit(1);
    }
    println!("SUCCESS: all datasets consistent.");
    Ok(())
}
