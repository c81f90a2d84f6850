use chrono::{Days, NaiveDate};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use super::parser::{self, ParseError};
use super::types::DayDataset;
use crate::utils::Zone;

const USER_AGENT: &str = "TgePricesServer/0.1";
/// Placeholder in the dated URL template.
pub const DATE_PLACEHOLDER: &str = "{date}";
const URL_DATE_FORMAT: &str = "%d-%m-%Y";

#[derive(Error, Debug)]
pub enum TgeError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to download TGE data from {url}: HTTP {status}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("Failed to parse TGE data: {0}")]
    Parse(#[from] ParseError),
}

/// How the RDN page is addressed.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchMode {
    /// Page per trading day; `{date}` is replaced with the day before delivery.
    Dated { url_template: String },
    /// A single page that announces which delivery day it covers.
    Current { url: String },
}

pub struct TgeClient {
    client: Client,
    mode: FetchMode,
    zone: Zone,
}

impl TgeClient {
    pub fn new(mode: FetchMode, zone: Zone, timeout: Duration) -> Result<Self, TgeError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self { client, mode, zone })
    }

    pub fn mode(&self) -> &FetchMode {
        &self.mode
    }

    /// URL holding the data for `target_date`.
    pub fn url_for(&self, target_date: NaiveDate) -> String {
        match &self.mode {
            FetchMode::Dated { url_template } => {
                // pages are keyed by the trading day, one day before delivery
                let trading_day = target_date
                    .checked_sub_days(Days::new(1))
                    .unwrap_or(target_date);
                url_template.replace(
                    DATE_PLACEHOLDER,
                    &trading_day.format(URL_DATE_FORMAT).to_string(),
                )
            }
            FetchMode::Current { url } => url.clone(),
        }
    }

    /// Download the raw page for `target_date`.
    pub async fn fetch(&self, target_date: NaiveDate) -> Result<String, TgeError> {
        let url = self.url_for(target_date);
        tracing::debug!("Downloading TGE data for {} from {}", target_date, url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::error!("Failed to download TGE data: {}", status);
            return Err(TgeError::Status { status, url });
        }

        let body = response.text().await?;
        tracing::debug!(
            "Downloaded TGE data for {} [{}]: {} bytes",
            target_date,
            status,
            body.len()
        );
        Ok(body)
    }

    /// Fetch and parse one delivery day. `None` when the exchange has not
    /// published it yet.
    pub async fn get_data_for_date(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DayDataset>, TgeError> {
        let html = self.fetch(date).await?;
        Ok(parser::parse_day(&html, date, &self.zone)?)
    }

    /// Everything currently available for `today` and the following day.
    pub async fn fetch_window(&self, today: NaiveDate) -> Result<Vec<DayDataset>, TgeError> {
        match &self.mode {
            FetchMode::Dated { .. } => {
                let mut days = Vec::with_capacity(2);
                let tomorrow = today.succ_opt().unwrap_or(today);
                for date in [today, tomorrow] {
                    if let Some(day) = self.get_data_for_date(date).await? {
                        days.push(day);
                    }
                }
                Ok(days)
            }
            FetchMode::Current { .. } => {
                let html = self.fetch(today).await?;
                let day = parser::parse_current(&html, &self.zone)?;
                Ok(vec![day])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    const FIXTURE: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/tge_rdn_08-08-2025.html"
    ));

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn dated_client(base: &str) -> TgeClient {
        TgeClient::new(
            FetchMode::Dated {
                url_template: format!("{}/rdn?dateShow={{date}}", base),
            },
            Zone::Named(chrono_tz::Europe::Warsaw),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_url_uses_previous_day() {
        let client = dated_client("https://tge.pl");
        assert_eq!(
            client.url_for(date(2025, 8, 8)),
            "https://tge.pl/rdn?dateShow=07-08-2025"
        );
        assert_eq!(
            client.url_for(date(2025, 1, 1)),
            "https://tge.pl/rdn?dateShow=31-12-2024"
        );
    }

    #[test]
    fn test_current_url_is_fixed() {
        let client = TgeClient::new(
            FetchMode::Current {
                url: "https://tge.pl/energia-elektryczna-rdn".to_string(),
            },
            Zone::Local,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.url_for(date(2025, 8, 8)),
            "https://tge.pl/energia-elektryczna-rdn"
        );
    }

    #[tokio::test]
    async fn test_fetch_window_dated() {
        let mut server = Server::new_async().await;
        let today = server
            .mock("GET", "/rdn")
            .match_query(Matcher::UrlEncoded("dateShow".into(), "07-08-2025".into()))
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(FIXTURE)
            .expect(1)
            .create_async()
            .await;
        // tomorrow's page still announces today's delivery
        let tomorrow = server
            .mock("GET", "/rdn")
            .match_query(Matcher::UrlEncoded("dateShow".into(), "08-08-2025".into()))
            .with_status(200)
            .with_body(FIXTURE)
            .expect(1)
            .create_async()
            .await;

        let client = dated_client(&server.url());
        let days = client.fetch_window(date(2025, 8, 8)).await.unwrap();

        assert_eq!(days.len(), 1);
        assert_eq!(days[0].date, date(2025, 8, 8));
        assert_eq!(days[0].hours.len(), 24);
        today.assert_async().await;
        tomorrow.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_window_current() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/energia-elektryczna-rdn")
            .with_status(200)
            .with_body(FIXTURE)
            .expect(1)
            .create_async()
            .await;

        let client = TgeClient::new(
            FetchMode::Current {
                url: format!("{}/energia-elektryczna-rdn", server.url()),
            },
            Zone::Named(chrono_tz::Europe::Warsaw),
            Duration::from_secs(5),
        )
        .unwrap();
        let days = client.fetch_window(date(2025, 8, 9)).await.unwrap();

        assert_eq!(days.len(), 1);
        assert_eq!(days[0].date, date(2025, 8, 8));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/rdn")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = dated_client(&server.url());
        let err = client.fetch(date(2025, 8, 8)).await.unwrap_err();

        match err {
            TgeError::Status { status, url } => {
                assert_eq!(status.as_u16(), 503);
                assert!(url.ends_with("dateShow=07-08-2025"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_broken_page_is_parse_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/rdn")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html><body>maintenance</body></html>")
            .create_async()
            .await;

        let client = dated_client(&server.url());
        let err = client.fetch_window(date(2025, 8, 8)).await.unwrap_err();
        assert!(matches!(err, TgeError::Parse(ParseError::DateNotFound)));
    }
}
