//! `harvest inspect`: parse a file locally and show what would be uploaded.

use std::path::Path;

use anyhow::Result;

use crate::readers::{load_metadata, open_reader, standard_for};

/// Rows of data shown after the column table.
const PREVIEW_ROWS: usize = 5;

pub fn run_inspect(path: &Path) -> Result<()> {
    let reader = open_reader(path)?;
    let metadata = load_metadata(reader.as_ref())?;
    let mapping = reader.standard_mapping();

    println!("{}", path.display());
    println!("{}", "=".repeat(path.display().to_string().len()));
    println!();
    println!("  Reader:      {}", metadata.parser);
    println!(
        "  Machine:     {}",
        metadata.core.machine_type.as_deref().unwrap_or("-")
    );
    println!(
        "  Dataset:     {}",
        metadata.core.dataset_name.as_deref().unwrap_or("-")
    );
    println!(
        "  Test date:   {}",
        metadata
            .test_date
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Rows:        {} (samples {} to {})",
        metadata.core.num_rows.unwrap_or(0),
        metadata.core.first_sample_no.map_or("-".to_string(), |n| n.to_string()),
        metadata.core.last_sample_no.map_or("-".to_string(), |n| n.to_string()),
    );

    if !metadata.extra.is_empty() {
        println!();
        println!("  Metadata:");
        for (key, value) in &metadata.extra {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            println!("    {:<24} {}", key, text);
        }
    }

    println!();
    println!(
        "  {:<28} {:<8} {:<6} {:<8} {}",
        "COLUMN", "UNIT", "DATA", "NUMERIC", "STANDARD"
    );
    println!("  {}", "-".repeat(72));
    for (index, column) in metadata.columns.iter().enumerate() {
        let standard = mapping
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, s)| s.name())
            .or_else(|| {
                standard_for(&reader.columns()[index])
                    .map(|_| "(claimed by an earlier column)")
            })
            .unwrap_or("");
        println!(
            "  {:<28} {:<8} {:<6} {:<8} {}",
            column.name,
            column.unit.as_deref().unwrap_or(""),
            if column.has_data { "yes" } else { "no" },
            if column.is_numeric { "yes" } else { "no" },
            standard
        );
    }

    let labels = reader.data_labels()?;
    println!();
    println!("  Data labels: {}", labels.len());
    for label in labels.iter().take(10) {
        println!(
            "    [{:>6}, {:>6})  {:<16} {}",
            label.range[0], label.range[1], label.label, label.info
        );
    }
    if labels.len() > 10 {
        println!("    ... {} more", labels.len() - 10);
    }

    println!();
    println!("  First rows:");
    for row in reader.rows()?.take(PREVIEW_ROWS) {
        let row = row?;
        let cells: Vec<String> = row.iter().map(|c| c.to_json().to_string()).collect();
        println!("    {}", cells.join("  "));
    }
    println!();

    Ok(())
}
