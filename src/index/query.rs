//! Read-only reports over the index.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Datelike, Utc};

use super::{Index, IndexRecord};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const SEARCH_LIMIT: usize = 20;
pub const DEFAULT_LARGEST: usize = 20;

/// Case-insensitive substring search over filenames. Returns the total
/// number of matches and at most [`SEARCH_LIMIT`] records.
pub fn search<'a>(index: &'a Index, query: &str) -> (usize, Vec<&'a IndexRecord>) {
    let needle = query.to_lowercase();
    let matches: Vec<_> = index
        .records()
        .filter(|r| r.filename.to_lowercase().contains(&needle))
        .collect();
    let total = matches.len();
    (total, matches.into_iter().take(SEARCH_LIMIT).collect())
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct YearBucket {
    pub count: u64,
    pub bytes: u64,
}

/// Item count and size per creation year, newest year first. Records with
/// no creation date are left out.
pub fn by_year(index: &Index) -> Vec<(i32, YearBucket)> {
    let mut years: BTreeMap<i32, YearBucket> = BTreeMap::new();
    for record in index.records() {
        let Some(created) = record.created else {
            continue;
        };
        let bucket = years.entry(created.year()).or_default();
        bucket.count += 1;
        bucket.bytes += record.size.unwrap_or(0);
    }
    years.into_iter().rev().collect()
}

/// The `limit` largest records with a known size, largest first.
pub fn largest(index: &Index, limit: usize) -> Vec<&IndexRecord> {
    let mut sized: Vec<_> = index.records().filter(|r| r.size.is_some()).collect();
    sized.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.filename.cmp(&b.filename)));
    sized.truncate(limit);
    sized
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VideoAges {
    pub total: u64,
    pub under_one_year: YearBucket,
    pub one_to_two_years: YearBucket,
    pub over_two_years: YearBucket,
    pub undated: u64,
}

pub fn videos_by_age(index: &Index, now: DateTime<Utc>) -> VideoAges {
    let mut ages = VideoAges::default();
    for record in index.records().filter(|r| r.is_video()) {
        ages.total += 1;
        let Some(age) = record.age_years(now) else {
            ages.undated += 1;
            continue;
        };
        let bucket = if age < 1.0 {
            &mut ages.under_one_year
        } else if age < 2.0 {
            &mut ages.one_to_two_years
        } else {
            &mut ages.over_two_years
        };
        bucket.count += 1;
        bucket.bytes += record.size.unwrap_or(0);
    }
    ages
}

pub fn render_stats(index: &Index) -> String {
    let stats = &index.statistics;
    let mut out = String::new();
    let _ = writeln!(out, "iCloud Library Index Statistics");
    if let Some(created) = index.created_at {
        let _ = writeln!(out, "Index created: {}", created.format("%Y-%m-%d %H:%M"));
    }
    if let Some(updated) = index.updated_at {
        let _ = writeln!(out, "Last updated:  {}", updated.format("%Y-%m-%d %H:%M"));
    }
    let _ = writeln!(out, "Total items: {}", stats.total_items);
    let _ = writeln!(out, "  Photos: {}", stats.photos);
    let _ = writeln!(out, "  Videos: {}", stats.videos);
    let _ = writeln!(out, "  Total size: {:.2} GB", stats.total_size_gb);
    let incomplete = index.needs_refresh_count();
    if incomplete > 0 {
        let _ = writeln!(out, "  Missing metadata: {} (run `index refresh`)", incomplete);
    }
    out
}

fn date_or_unknown(date: Option<DateTime<Utc>>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn kind_or_unknown(record: &IndexRecord) -> &'static str {
    record.kind.map_or("unknown", |k| k.as_str())
}

pub fn render_search(index: &Index, query: &str) -> String {
    let (total, hits) = search(index, query);
    let mut out = String::new();
    if total == 0 {
        let _ = writeln!(out, "No files found matching '{}'", query);
        return out;
    }
    let _ = writeln!(out, "Found {} matching files:", total);
    for record in hits {
        let _ = writeln!(out, "{}", record.filename);
        if let Some(mb) = record.size_mb() {
            let _ = writeln!(out, "   Size: {:.2} MB", mb);
        }
        let _ = writeln!(out, "   Created: {}", date_or_unknown(record.created));
        let _ = writeln!(out, "   Type: {}", kind_or_unknown(record));
        if let Some((w, h)) = record.dimensions {
            let _ = writeln!(out, "   Dimensions: {}x{}", w, h);
        }
    }
    if total > SEARCH_LIMIT {
        let _ = writeln!(out, "... and {} more", total - SEARCH_LIMIT);
    }
    out
}

pub fn render_years(index: &Index) -> String {
    let mut out = String::from("Breakdown by year:\n");
    for (year, bucket) in by_year(index) {
        let _ = writeln!(
            out,
            "{}: {:5} items, {:7.2} GB",
            year,
            bucket.count,
            bucket.bytes as f64 / BYTES_PER_GB
        );
    }
    out
}

pub fn render_largest(index: &Index, limit: usize) -> String {
    let mut out = format!("Top {} largest files:\n", limit);
    for (i, record) in largest(index, limit).into_iter().enumerate() {
        let _ = writeln!(out, "{:2}. {}", i + 1, record.filename);
        let _ = writeln!(
            out,
            "    {:8.2} MB | {:7} | {}",
            record.size.unwrap_or(0) as f64 / BYTES_PER_MB,
            kind_or_unknown(record),
            date_or_unknown(record.created)
        );
    }
    out
}

pub fn render_videos(index: &Index, now: DateTime<Utc>) -> String {
    let ages = videos_by_age(index, now);
    if ages.total == 0 {
        return "No videos found in index\n".to_string();
    }
    let mut out = format!("Videos by age ({} total):\n", ages.total);
    for (label, bucket) in [
        ("< 1 year", ages.under_one_year),
        ("1-2 years", ages.one_to_two_years),
        ("> 2 years", ages.over_two_years),
    ] {
        if bucket.count > 0 {
            let _ = writeln!(
                out,
                "{:12}: {:5} videos, {:7.2} GB",
                label,
                bucket.count,
                bucket.bytes as f64 / BYTES_PER_GB
            );
        }
    }
    if ages.undated > 0 {
        let _ = writeln!(out, "{:12}: {:5} videos", "undated", ages.undated);
    }
    out
}
