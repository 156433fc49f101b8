use crate::verify::{Issue, Severity, VerifyReport};
use std::collections::BTreeMap;

/// Renders a full-replacement unified diff: every old line removed, every
/// new line added, under a single hunk.
///
/// The output is accepted by `git apply -p0`. An empty old side is written
/// as `-0,0`, and a side without a trailing newline gets the usual
/// `\ No newline at end of file` marker.
pub fn replacement_diff(display_path: &str, old: Option<&str>, new: &str) -> String {
    let old_lines: Vec<&str> = old.map(|o| o.split_inclusive('\n').collect()).unwrap_or_default();
    let new_lines: Vec<&str> = new.split_inclusive('\n').collect();

    let mut out = format!("--- {display_path}\n+++ {display_path}\n");
    out.push_str(&format!(
        "@@ -{} +{} @@\n",
        hunk_range(old_lines.len()),
        hunk_range(new_lines.len())
    ));

    push_side(&mut out, '-', &old_lines);
    push_side(&mut out, '+', &new_lines);

    out
}

fn hunk_range(count: usize) -> String {
    if count == 0 {
        "0,0".to_string()
    } else {
        format!("1,{count}")
    }
}

fn push_side(out: &mut String, prefix: char, lines: &[&str]) {
    for line in lines {
        out.push(prefix);
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push_str("\n\\ No newline at end of file\n");
        }
    }
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// First `len` characters of a hex digest.
pub fn truncate_hash(hash: &str, len: usize) -> &str {
    hash.get(..len).unwrap_or(hash)
}

fn severity_code(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "ok",
        Severity::Warn => "W",
        Severity::Error => "E",
    }
}

fn format_issue(issue: &Issue) -> Vec<String> {
    let mut lines = Vec::new();
    let mut message = issue.message.lines();

    if let Some(first) = message.next() {
        lines.push(format!("{:<2} {}", severity_code(issue.severity), first));
    }
    for rest in message {
        lines.push(format!("   {}", rest));
    }
    if let Some(strategy) = &issue.strategy {
        lines.push(format!("   fix: {}", strategy));
    }

    lines
}

pub fn print_report(report: &VerifyReport) {
    for issue in &report.issues {
        for line in format_issue(issue) {
            println!("{}", line);
        }
    }

    if let Some(result) = &report.result {
        println!(
            "{} of {} tracked files verified",
            result.verified_files, result.total_files
        );
    }
}

/// Prints response fields as `key: value`. Multi-line values follow their
/// key on separate lines.
pub fn print_fields(fields: &BTreeMap<&'static str, String>) {
    for line in format_fields(fields) {
        println!("{}", line);
    }
}

fn format_fields(fields: &BTreeMap<&'static str, String>) -> Vec<String> {
    let mut lines = Vec::new();

    for (key, value) in fields {
        if value.contains('\n') {
            lines.push(format!("{}:", key));
            lines.extend(value.lines().map(|l| format!("  {}", l)));
        } else {
            lines.push(format!("{}: {}", key, value));
        }
    }

    lines
}
