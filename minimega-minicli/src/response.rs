//! Responses and bundle rendering
//!
//! A handler emits one or more bundles; each bundle holds one
//! [`Response`] per host it covers. Bundles render as a single aligned
//! table when every response shares a header, per-host tables when
//! headers diverge, or CSV / JSON on request. Hosts sort in the range
//! parser's natural order so output is deterministic.

use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use minimega_ranges::host_cmp;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Host that produced this response
    pub host: String,
    /// Free-form text output
    pub response: String,
    /// Column names when the output is tabular
    pub header: Vec<String>,
    /// Row data, one inner vec per row
    pub tabular: Vec<Vec<String>>,
    /// Error text; empty means success
    pub error: String,
    /// Key/value annotations attached to the response
    pub tags: HashMap<String, String>,
}

impl Response {
    pub fn text(host: impl Into<String>, response: impl Into<String>) -> Self {
        Response {
            host: host.into(),
            response: response.into(),
            ..Default::default()
        }
    }

    pub fn error(host: impl Into<String>, error: impl Into<String>) -> Self {
        Response {
            host: host.into(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn table(
        host: impl Into<String>,
        header: Vec<String>,
        tabular: Vec<Vec<String>>,
    ) -> Self {
        Response {
            host: host.into(),
            header,
            tabular,
            ..Default::default()
        }
    }
}

/// One emission from a handler: a response per covered host
pub type Bundle = Vec<Response>;

/// Sort a bundle by host in natural order
pub fn sort_bundle(bundle: &mut Bundle) {
    bundle.sort_by(|a, b| host_cmp(&a.host, &b.host));
}

/// Render a bundle the way the console shows it: a shared table when
/// headers agree, otherwise per-host sections
pub fn render_text(bundle: &Bundle) -> String {
    let mut bundle = bundle.clone();
    sort_bundle(&mut bundle);

    let tabular: Vec<&Response> = bundle.iter().filter(|r| !r.header.is_empty()).collect();
    let shared_header = tabular
        .first()
        .map(|first| tabular.iter().all(|r| r.header == first.header))
        .unwrap_or(false);

    let mut out = String::new();

    if shared_header && !tabular.is_empty() {
        let header = &tabular[0].header;
        let rows: Vec<Vec<String>> = tabular
            .iter()
            .flat_map(|r| {
                r.tabular.iter().map(|row| {
                    let mut full = vec![r.host.clone()];
                    full.extend(row.iter().cloned());
                    full
                })
            })
            .collect();

        let mut full_header = vec!["host".to_string()];
        full_header.extend(header.iter().cloned());
        out.push_str(&render_aligned(&full_header, &rows));
    } else {
        for r in &tabular {
            out.push_str(&format!("{}:\n", r.host));
            out.push_str(&render_aligned(&r.header, &r.tabular));
            out.push('\n');
        }
    }

    for r in bundle.iter().filter(|r| r.header.is_empty()) {
        if !r.response.is_empty() {
            if bundle.len() > 1 {
                out.push_str(&format!("{}: {}\n", r.host, r.response));
            } else {
                out.push_str(&r.response);
                if !r.response.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        if !r.error.is_empty() {
            out.push_str(&format!("E {}: {}\n", r.host, r.error));
        }
    }

    out
}

fn render_aligned(header: &[String], rows: &[Vec<String>]) -> String {
    let columns = header.len();
    let mut widths: Vec<usize> = header.iter().map(String::len).collect();

    for row in rows {
        for (i, cell) in row.iter().enumerate().take(columns) {
            if cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let mut out = String::new();

    let fmt_row = |cells: &[String], widths: &[usize]| -> String {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{:<width$}", cell, width = *w))
            .join(" | ")
            .trim_end()
            .to_string()
    };

    out.push_str(&fmt_row(header, &widths));
    out.push('\n');

    for row in rows {
        out.push_str(&fmt_row(row, &widths));
        out.push('\n');
    }

    out
}

/// Render a bundle as CSV: host column first, then the shared header
/// columns or a single response column
pub fn render_csv(bundle: &Bundle) -> String {
    let mut bundle = bundle.clone();
    sort_bundle(&mut bundle);

    let mut out = String::new();

    let tabular = bundle.iter().any(|r| !r.header.is_empty());
    if tabular {
        if let Some(first) = bundle.iter().find(|r| !r.header.is_empty()) {
            let mut header = vec!["host".to_string()];
            header.extend(first.header.iter().cloned());
            out.push_str(&header.iter().map(|c| csv_escape(c)).join(","));
            out.push('\n');
        }

        for r in &bundle {
            for row in &r.tabular {
                out.push_str(&csv_escape(&r.host));
                for cell in row {
                    out.push(',');
                    out.push_str(&csv_escape(cell));
                }
                out.push('\n');
            }
        }
    } else {
        out.push_str("host,response,error\n");
        for r in &bundle {
            out.push_str(&format!(
                "{},{},{}\n",
                csv_escape(&r.host),
                csv_escape(&r.response),
                csv_escape(&r.error)
            ));
        }
    }

    out
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Render a bundle as JSON
pub fn render_json(bundle: &Bundle) -> String {
    let mut bundle = bundle.clone();
    sort_bundle(&mut bundle);
    serde_json::to_string(&bundle).unwrap_or_else(|_| "[]".to_string())
}
