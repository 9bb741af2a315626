use anyhow::Result;
use prettytable::{Cell, Row, Table, row};
use preloader_service::caching::CacheStats;
use preloader_service::preload::PreloadOutcomes;
use serde::Serialize;

use crate::cli::OutputFormat;

/// What happened to a single requested resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutcomeRow {
    pub key: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub entries: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub expirations: u64,
}

/// The result of a preload run.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub outcomes: Vec<OutcomeRow>,
    pub cache: CacheSummary,
}

impl Report {
    pub fn new(outcomes: &PreloadOutcomes, stats: CacheStats) -> Self {
        let outcomes = outcomes
            .iter()
            .map(|(key, outcome)| match outcome {
                Ok(payload) => OutcomeRow {
                    key: key.clone(),
                    status: "ok",
                    size: Some(payload.len()),
                    content_type: payload.content_type.clone(),
                    error: None,
                },
                Err(error) => OutcomeRow {
                    key: key.clone(),
                    status: error.metrics_tag(),
                    size: None,
                    content_type: None,
                    error: Some(error.to_string()),
                },
            })
            .collect();

        let cache = CacheSummary {
            entries: stats.entries,
            capacity: stats.capacity,
            evictions: stats.evictions,
            expirations: stats.expirations,
        };

        Self { outcomes, cache }
    }

    /// Number of resources that failed to load.
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|row| row.status != "ok").count()
    }
}

pub fn print(report: &Report, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Table => print_table(report),
    }
    Ok(())
}

fn print_table(report: &Report) {
    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(row![b => "Resource", "Status", "Size", "Content Type", "Error"]);

    for outcome in &report.outcomes {
        let style = if outcome.status == "ok" { "Fg" } else { "Fr" };
        table.add_row(Row::new(vec![
            Cell::new(&outcome.key),
            Cell::new(outcome.status).style_spec(style),
            Cell::new(&outcome.size.map(|size| size.to_string()).unwrap_or_default())
                .style_spec("r"),
            Cell::new(outcome.content_type.as_deref().unwrap_or("")),
            Cell::new(outcome.error.as_deref().unwrap_or("")),
        ]));
    }

    table.printstd();

    let cache = &report.cache;
    println!(
        "{} of {} resources loaded, cache holds {}/{} entries ({} evicted, {} expired)",
        report.outcomes.len() - report.failures(),
        report.outcomes.len(),
        cache.entries,
        cache.capacity,
        cache.evictions,
        cache.expirations,
    );
}
