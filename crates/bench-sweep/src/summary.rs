//! End-of-sweep summary: throughput grid and best cell

use crate::results::ResultRow;
use bench_core::{axis_label, SweepCell};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use std::fmt;

/// Highest-throughput cell seen so far
#[derive(Debug, Clone, PartialEq)]
pub struct BestCell {
    pub cell: SweepCell,
    pub throughput: f64,
}

impl BestCell {
    /// Replace the current best only on a strictly higher throughput
    pub fn update(best: &mut Option<BestCell>, row: &ResultRow) -> bool {
        let throughput = row.throughput();
        let improved = match best {
            Some(current) => throughput > current.throughput,
            None => throughput > 0.0,
        };
        if improved {
            *best = Some(BestCell {
                cell: row.cell.clone(),
                throughput,
            });
        }
        improved
    }
}

impl fmt::Display for BestCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "best {} throughput_tps={:.1}", self.cell, self.throughput)
    }
}

type RowKey = (usize, u32, Option<u32>, Option<u32>, u32);

fn row_key(cell: &SweepCell) -> RowKey {
    (
        cell.instances,
        cell.parallel,
        cell.batch,
        cell.ubatch,
        cell.max_tokens,
    )
}

/// Throughput grid: one line per deployment and max_tokens, one column
/// per concurrency. Missing cells show `-`.
pub fn throughput_table(rows: &[ResultRow]) -> Table {
    let mut concurrency: Vec<usize> = Vec::new();
    let mut keys: Vec<RowKey> = Vec::new();
    for row in rows {
        if !concurrency.contains(&row.cell.concurrency) {
            concurrency.push(row.cell.concurrency);
        }
        let key = row_key(&row.cell);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    concurrency.sort_unstable();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let headers = ["instances", "parallel", "batch", "ubatch", "max_tokens"]
        .into_iter()
        .map(String::from)
        .chain(concurrency.iter().map(|c| format!("c={}", c)));
    let header_cells: Vec<Cell> = headers
        .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for key in &keys {
        let (instances, parallel, batch, ubatch, max_tokens) = *key;
        let mut line = vec![
            instances.to_string(),
            parallel.to_string(),
            axis_label(batch),
            axis_label(ubatch),
            max_tokens.to_string(),
        ];
        for &c in &concurrency {
            let value = rows
                .iter()
                .rev()
                .find(|row| row_key(&row.cell) == *key && row.cell.concurrency == c)
                .map(|row| format!("{:.1}", row.throughput()))
                .unwrap_or_else(|| "-".to_string());
            line.push(value);
        }
        table.add_row(line);
    }

    table
}

/// Grid plus the best line, ready to print
pub fn render_summary(rows: &[ResultRow], best: Option<&BestCell>) -> String {
    let best_line = match best {
        Some(best) => best.to_string(),
        None => "best none (no cell produced tokens)".to_string(),
    };
    if rows.is_empty() {
        return best_line;
    }
    format!("{}\n{}", throughput_table(rows), best_line)
}
