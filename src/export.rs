use anyhow::Context;
use csv::WriterBuilder;
use serde::Serialize;
use std::path::Path;

use crate::calc::round_to_tenth;

/// One grade-export row: percentages are pre-aggregated, `None` renders as a
/// blank cell rather than 0.
#[derive(Debug, Clone)]
pub struct GradeCsvRow {
    pub display_name: String,
    pub category_percents: Vec<Option<f64>>,
    pub final_percent: Option<f64>,
}

fn percent_cell(v: Option<f64>) -> String {
    match v {
        Some(p) => format!("{}", round_to_tenth(p)),
        None => String::new(),
    }
}

/// Writes the class grade sheet: one column per category plus the final.
/// Column set is dynamic, so rows are written as records, not serialized.
pub fn write_grades_csv(
    path: &Path,
    category_names: &[String],
    rows: &[GradeCsvRow],
) -> anyhow::Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }

    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.to_string_lossy()))?;

    let mut header: Vec<String> = Vec::with_capacity(category_names.len() + 2);
    header.push("Student".to_string());
    header.extend(category_names.iter().cloned());
    header.push("Final".to_string());
    writer.write_record(&header).context("write csv header")?;

    for row in rows {
        let mut record: Vec<String> = Vec::with_capacity(header.len());
        record.push(row.display_name.clone());
        for p in &row.category_percents {
            record.push(percent_cell(*p));
        }
        record.push(percent_cell(row.final_percent));
        writer.write_record(&record).context("write csv row")?;
    }

    writer.flush().context("flush csv")?;
    Ok(rows.len())
}

#[derive(Debug, Clone, Serialize)]
pub struct KteaCsvRow {
    pub administered_on: String,
    pub form: String,
    pub composite: String,
    pub subtest_code: String,
    pub subtest_label: String,
    pub raw_score: Option<f64>,
    pub standard_score: Option<f64>,
    pub grade_equivalent: String,
    pub percentile: Option<f64>,
}

/// Flat KTEA export: one row per (administration, subtest), already in
/// composite/catalog order.
pub fn write_ktea_csv(path: &Path, rows: &[KteaCsvRow]) -> anyhow::Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }

    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.to_string_lossy()))?;
    for row in rows {
        writer.serialize(row).context("write ktea csv row")?;
    }
    writer.flush().context("flush csv")?;
    Ok(rows.len())
}
