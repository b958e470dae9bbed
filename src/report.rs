//! Fixed-width text rendering of a [`Snapshot`].

use std::fmt::Write;

use crate::layout::{bucket_size, max_spans, ProtectionClass, Snapshot, HISTOGRAM_BUCKETS};
use crate::memory::PAGE_SIZE;

const BYTES_PER_MIB: f64 = (1024 * 1024) as f64;

/// Render the category table followed by the free-span histogram.
///
/// Percentages are relative to `total_bytes`, the size of the addressable space.
pub fn render(snapshot: &Snapshot, total_bytes: u64) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{:<20} {:>10} {:>12} {:>9}", "Category", "Pages", "Size (MB)", "Percent");
    let _ = writeln!(out, "{:-<54}", "");

    let mut rows: Vec<(&str, u64)> = vec![
        ("Free", snapshot.free_pages),
        ("Committed", snapshot.committed_pages),
        ("Reserved", snapshot.reserved_pages),
    ];
    rows.extend(
        ProtectionClass::ALL
            .iter()
            .map(|&class| (class.label(), snapshot.protection_pages(class))),
    );
    rows.push(("Guard", snapshot.guard_pages));
    rows.push(("Image", snapshot.image_pages()));
    rows.push(("Mapped", snapshot.mapped_pages()));
    rows.push(("Private", snapshot.private_pages()));

    for (label, pages) in rows {
        let _ = writeln!(out, "{}", category_row(label, pages, total_bytes));
    }

    let _ = writeln!(out);
    out.push_str(&render_histogram(snapshot, total_bytes));
    out
}

/// Render only the free-span histogram: per size class the span count, how many spans of
/// that size the space could hold, and the cascading count.
pub fn render_histogram(snapshot: &Snapshot, total_bytes: u64) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{:<6} {:>10} {:>12} {:>12}", "Span", "Count", "Max", "Cascading");
    let _ = writeln!(out, "{:-<43}", "");

    for bucket in 0..HISTOGRAM_BUCKETS {
        let _ = writeln!(
            out,
            "{:<6} {:>10} {:>12} {:>12}",
            size_label(bucket_size(bucket)),
            snapshot.free_span_histogram[bucket],
            max_spans(bucket, total_bytes),
            snapshot.cascading_count(bucket)
        );
    }

    out
}

/// One category line: label, page count, size in MiB and share of the address space.
pub fn category_row(label: &str, pages: u64, total_bytes: u64) -> String {
    let bytes = pages as f64 * PAGE_SIZE as f64;
    let percent = if total_bytes > 0 {
        bytes / total_bytes as f64 * 100.0
    } else {
        0.0
    };

    format!("{:<20} {:>10} {:>12.2} {:>8.2}%", label, pages, bytes / BYTES_PER_MIB, percent)
}

/// `4K`, `512K`, `1M`, `2G`: a power-of-two size with the largest whole suffix.
pub fn size_label(bytes: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    if bytes >= GIB {
        format!("{}G", bytes / GIB)
    } else if bytes >= MIB {
        format!("{}M", bytes / MIB)
    } else {
        format!("{}K", bytes / KIB)
    }
}
