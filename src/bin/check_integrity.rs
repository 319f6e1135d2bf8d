/// Audit raw daily trade files before re-partitioning.
///
/// Reports duplicate trade ids, trades dated outside the file's day,
/// out-of-order timestamps or ids, and the largest gap between trades.
///
/// Usage:
///   cargo run --release --bin check_integrity <dir> [pattern]
use std::env;
use std::path::Path;

use deribit_options_parser::integrity::{check_source_dir, IdOrdering};
use deribit_options_parser::metrics::format_timestamp_us;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <dir> [pattern]", args[0]);
        std::process::exit(1);
    }
    let dir = Path::new(&args[1]);
    let pattern = args.get(2).map(String::as_str).unwrap_or("*.feather");

    println!("=== TRADE FILE INTEGRITY CHECK ===\n");
    println!("Checking {} ({})", dir.display(), pattern);

    let report = match check_source_dir(dir, pattern) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let (Some(first), Some(last)) = (report.files.first(), report.files.last()) {
        println!("Found {} readable files", report.files.len());
        println!("Range: {} to {}", stem(&first.path), stem(&last.path));
    }

    for file in report.files.iter().filter(|f| f.issue_count() > 0) {
        println!("\n{}:", file.path.display());
        if !file.duplicate_ids.is_empty() {
            println!(
                "  {} duplicate id(s) over {} rows, e.g. {}",
                file.duplicate_ids.len(),
                file.duplicate_rows,
                file.duplicate_ids[0]
            );
        }
        if file.spillover_rows > 0 {
            if let Some(date) = file.expected_date {
                println!("  {} trade(s) dated outside {}", file.spillover_rows, date);
            }
        }
        if !file.timestamps_sorted {
            println!("  timestamps not monotonic");
        }
        if file.id_ordering == IdOrdering::NotMonotonic {
            println!("  trade ids not monotonic");
        }
    }
    for failure in &report.unreadable {
        println!("\n{}: unreadable ({})", failure.path.display(), failure.error);
    }

    println!("\n=== SUMMARY ===");
    println!("Total trades:            {}", report.total_rows());
    println!("Files with duplicates:   {}", report.files_with_duplicates());
    println!("Files with spillover:    {}", report.files_with_spillover());
    println!("Files out of order:      {}", report.files_out_of_order());
    println!("Unreadable files:        {}", report.unreadable.len());
    if let Some((path, gap)) = report.largest_gap() {
        println!(
            "Largest gap:             {:.2}h in {} ({} -> {})",
            gap.hours(),
            stem(path),
            format_timestamp_us(gap.start_us),
            format_timestamp_us(gap.end_us)
        );
    }

    if report.issue_count() > 0 {
        println!("\nFAILURE: {} issue(s) found", report.issue_count());
        std::process::exit(1);
    }
    println!("\nSUCCESS: no issues found");
    Ok(())
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
