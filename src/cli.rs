//! Command handlers for the ucdb2cobertura CLI.
//!
//! The handler returns its console output as a `String`, making it easy to
//! test without capturing stdout.

use std::path::Path;

use anyhow::{Context, Result};

use crate::ucdb;

/// Convert a UCDB XML file into a Cobertura XML file. Returns the summary
/// lines printed to the operator after a successful run.
pub fn cmd_export(
    ucdb_file: &Path,
    cobertura_file: &Path,
    merge_instances: bool,
) -> Result<String> {
    let input = std::fs::read(ucdb_file)
        .with_context(|| format!("Failed to read UCDB file '{}'", ucdb_file.display()))?;

    let outcome = ucdb::parse(&input, merge_instances)
        .with_context(|| format!("Failed to parse UCDB file '{}'", ucdb_file.display()))?;

    let mut coverage = outcome.coverage;
    let xml = coverage
        .to_xml()
        .context("Failed to serialize Cobertura report")?;

    std::fs::write(cobertura_file, &xml).with_context(|| {
        format!(
            "Failed to write Cobertura file '{}'",
            cobertura_file.display()
        )
    })?;

    Ok(format!(
        "Statements: {}/{} covered\nLine coverage: {:.2}%\n",
        outcome.statements_covered,
        outcome.statements_count,
        coverage.line_rate() * 100.0
    ))
}
