//! Output formatting for command results.
//!
//! Supports plain text (tables for listings) and JSON.

use anyhow::Result;
use chunkstore_engine::AnalysisReport;
use comfy_table::{Cell, ContentArrangement, Table};
use serde::Serialize;

use crate::commands::{DumpInfo, RangeListing};

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Text and tables.
    Text,
    /// Pretty-printed JSON.
    Json,
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);
    table
}

/// Formats an analyzer report.
pub fn format_report(report: &AnalysisReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(report.to_string()),
        OutputFormat::Json => to_json(report),
    }
}

/// Formats a dump summary.
pub fn format_info(info: &DumpInfo, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(info);
    }

    let status = &info.status;
    let rows: Vec<(&str, String)> = vec![
        ("file", format!("{} ({} bytes)", info.path, info.file_bytes)),
        ("owner", format!("{:#06x}", info.owner)),
        ("arena size", info.arena_size.to_string()),
        ("max block size", info.max_block_size.to_string()),
        ("pointer width", info.pointer_width.to_string()),
        ("size classes", info.size_classes.to_string()),
        ("lid levels", info.lid_levels.to_string()),
        ("next local id", info.next_local_id.to_string()),
        (
            "recycler",
            format!(
                "{} queued / {} capacity, {} available",
                info.recycler_ring, info.recycler_capacity, info.recycler_available
            ),
        ),
        (
            "allocated",
            format!(
                "{} blocks, {} bytes ({} payload)",
                status.allocated_blocks, status.allocated_bytes, status.payload_bytes
            ),
        ),
        (
            "free",
            format!("{} blocks, {} bytes", status.free_blocks, status.free_bytes),
        ),
        ("markers", status.marker_bytes.to_string()),
        ("utilization", format!("{:.1}%", info.utilization * 100.0)),
        ("conserved", info.conserved.to_string()),
    ];

    let mut table = new_table();
    table.set_header(vec!["field", "value"]);
    for (field, value) in rows {
        table.add_row(vec![Cell::new(field), Cell::new(value)]);
    }
    Ok(table.to_string())
}

/// Formats an id range listing.
pub fn format_ranges(listing: &RangeListing, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(listing);
    }
    if listing.ranges.is_empty() {
        return Ok("(no ids)".to_string());
    }

    let mut table = new_table();
    table.set_header(vec!["first", "last", "count"]);
    for range in &listing.ranges {
        table.add_row(vec![
            Cell::new(range.start),
            Cell::new(range.end),
            Cell::new(range.len()),
        ]);
    }
    let kind = if listing.migrated { "migrated" } else { "local" };
    Ok(format!(
        "{table}\n{} {kind} id(s) in {} range(s)",
        listing.ids,
        listing.ranges.len()
    ))
}
