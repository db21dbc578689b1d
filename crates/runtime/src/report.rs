//! Spending report over a date range.

use std::collections::HashMap;

use bumblebee_store::Expense;
use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;

const BAR_WIDTH: usize = 20;

/// Inclusive calendar-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// `None` when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// The `days` days ending with `today`.
    pub fn last_days(today: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: today - Duration::days(span),
            end: today,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub summary: String,
    /// Text bar chart, one row per category.  `None` for an empty report.
    pub chart: Option<String>,
    pub count: usize,
    pub total: f64,
    /// Per-category sums, largest first.
    pub by_category: Vec<(String, f64)>,
}

impl Report {
    /// Summary and chart as one message body.
    pub fn render(&self) -> String {
        match &self.chart {
            Some(chart) => format!("{}\n\n{}", self.summary, chart),
            None => self.summary.clone(),
        }
    }
}

/// Aggregate the entries whose creation date (local to `tz`) lies in `range`.
pub fn build_report(entries: &[Expense], range: DateRange, tz: Tz) -> Report {
    let selected: Vec<&Expense> = entries
        .iter()
        .filter(|e| range.contains(e.created_at.with_timezone(&tz).date_naive()))
        .collect();

    let header = format!("Expenses from {} to {}", range.start, range.end);
    if selected.is_empty() {
        return Report {
            summary: format!("{header}\nNo data for this period."),
            chart: None,
            count: 0,
            total: 0.0,
            by_category: Vec::new(),
        };
    }

    let mut sums: HashMap<&str, f64> = HashMap::new();
    for entry in &selected {
        *sums.entry(entry.category.trim()).or_default() += entry.price;
    }
    let mut by_category: Vec<(String, f64)> = sums
        .into_iter()
        .map(|(category, sum)| (category.to_string(), sum))
        .collect();
    by_category.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let total: f64 = selected.iter().map(|e| e.price).sum();
    let mut summary = format!(
        "{header}\nEntries: {}\nTotal: {total:.2}\n\nBy category:",
        selected.len()
    );
    for (category, sum) in &by_category {
        summary.push_str(&format!("\n{category}: {sum:.2}"));
    }

    Report {
        summary,
        chart: Some(chart(&by_category)),
        count: selected.len(),
        total,
        by_category,
    }
}

fn chart(rows: &[(String, f64)]) -> String {
    let max = rows.iter().map(|(_, sum)| *sum).fold(0.0_f64, f64::max);
    let label_width = rows
        .iter()
        .map(|(category, _)| category.chars().count())
        .max()
        .unwrap_or(0);

    rows.iter()
        .map(|(category, sum)| {
            let filled = if max > 0.0 {
                ((sum / max) * BAR_WIDTH as f64).round() as usize
            } else {
                0
            };
            // Non-zero amounts always get at least one block.
            let filled = if *sum > 0.0 { filled.max(1) } else { 0 };
            format!(
                "{category:<label_width$} {}{} {sum:.2}",
                "█".repeat(filled),
                "░".repeat(BAR_WIDTH - filled)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
