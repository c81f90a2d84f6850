use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use super::types::{DayDataset, HourRecord};
use crate::utils::Zone;

const DATE_HEADING: &str = ".kontrakt-date";
const HOURLY_TABLE_BODY: &str = "#footable_kontrakty_godzinowe > tbody";
const HOURLY_MARKER: &str = "godzinowe";
const DELIVERY_MARKER: &str = "dla dostawy w dniu";
const DATE_FORMAT: &str = "%d-%m-%Y";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("date not found")]
    DateNotFound,
    #[error("invalid delivery date: {0}")]
    InvalidDate(String),
    #[error("hourly table not found")]
    TableNotFound,
}

/// Parse an RDN page that was requested for `requested_date`.
///
/// `Ok(None)` means the page announces another delivery day, i.e. the
/// exchange has not published the requested day yet.
pub fn parse_day(
    raw_html: &str,
    requested_date: NaiveDate,
    zone: &Zone,
) -> Result<Option<DayDataset>, ParseError> {
    let document = Html::parse_document(raw_html);
    let announced = delivery_date(&document)?;
    if announced != requested_date {
        tracing::info!(
            "Page announces delivery date {}, requested {}",
            announced,
            requested_date
        );
        return Ok(None);
    }
    let hours = parse_hours(&document, requested_date, zone)?;
    Ok(Some(DayDataset {
        date: requested_date,
        hours,
    }))
}

/// Parse the "current" RDN page, taking the delivery date from the page itself.
pub fn parse_current(raw_html: &str, zone: &Zone) -> Result<DayDataset, ParseError> {
    let document = Html::parse_document(raw_html);
    let date = delivery_date(&document)?;
    let hours = parse_hours(&document, date, zone)?;
    Ok(DayDataset { date, hours })
}

fn selector(css: &'static str) -> Selector {
    Selector::parse(css).expect("static CSS selector")
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn delivery_date(document: &Html) -> Result<NaiveDate, ParseError> {
    let headings: Vec<String> = document
        .select(&selector(DATE_HEADING))
        .map(element_text)
        .collect();

    // Hourly contracts heading wins over any other delivery announcement
    let date_text = headings
        .iter()
        .filter(|text| text.contains(HOURLY_MARKER))
        .chain(headings.iter().filter(|text| text.contains(DELIVERY_MARKER)))
        .find_map(|text| find_date(text))
        .ok_or_else(|| {
            tracing::error!("No date of data found");
            ParseError::DateNotFound
        })?;

    NaiveDate::parse_from_str(date_text, DATE_FORMAT)
        .map_err(|_| ParseError::InvalidDate(date_text.to_string()))
}

/// First `dd-mm-yyyy` occurrence in `text`.
fn find_date(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    (0..bytes.len().saturating_sub(9)).find_map(|start| {
        let window = bytes.get(start..start + 10)?;
        let matches = window.iter().enumerate().all(|(i, b)| match i {
            2 | 5 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
        // all-ASCII window, so both ends sit on char boundaries
        matches.then(|| &text[start..start + 10])
    })
}

fn parse_hours(
    document: &Html,
    date: NaiveDate,
    zone: &Zone,
) -> Result<Vec<HourRecord>, ParseError> {
    let body = document
        .select(&selector(HOURLY_TABLE_BODY))
        .next()
        .ok_or(ParseError::TableNotFound)?;

    let row_selector = selector("tr");
    let cell_selector = selector("td");
    let mut records: Vec<HourRecord> = Vec::with_capacity(24);

    for row in body.select(&row_selector) {
        let cells: Vec<String> = row.select(&cell_selector).map(element_text).collect();
        let Some(hour) = cells.first().and_then(|c| hour_range_start(c)) else {
            continue;
        };
        let Some(time) = zone.at_hour(date, hour) else {
            tracing::debug!("Skipping row with out-of-range hour {}", hour);
            continue;
        };
        if records.iter().any(|r| r.time == time) {
            tracing::debug!("Skipping duplicate row for hour {}", hour);
            continue;
        }
        let column = |index: usize| cells.get(index).map_or(0.0, |c| cell_value(c));
        records.push(HourRecord {
            time,
            fixing1_rate: column(1),
            fixing1_volume: column(2),
            fixing2_rate: column(3),
            fixing2_volume: column(4),
        });
    }

    Ok(records)
}

/// Start hour of an `H-H` / `HH-HH` range cell.
fn hour_range_start(cell: &str) -> Option<u32> {
    let (from, to) = cell.trim().split_once('-')?;
    let is_hour = |part: &str| (1..=2).contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit());
    if !is_hour(from) || !is_hour(to) {
        return None;
    }
    from.parse().ok()
}

fn cell_value(cell: &str) -> f64 {
    parse_locale_float(cell).unwrap_or_else(|| {
        tracing::debug!("Unparseable number {:?}, using 0.0", cell);
        0.0
    })
}

/// Polish number format: `1 234,56`. Only finite values are accepted.
pub fn parse_locale_float(value: &str) -> Option<f64> {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}
