use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::prices::connector::{FetchMode, DATE_PLACEHOLDER};
use crate::prices::store::DEFAULT_STATE_PATH;
use crate::prices::types::Field;
use crate::sensors::PriceUnit;
use crate::template::{Template, TemplateSet};
use crate::utils::{parse_timezone, Zone};

pub const DEFAULT_URL: &str = "https://tge.pl/energia-elektryczna-rdn";
pub const DEFAULT_DATA_URL_TEMPLATE: &str = "https://tge.pl/energia-elektryczna-rdn?dateShow={date}";

#[derive(Clone, Debug)]
pub struct Config {
    pub fetch_mode: FetchMode,
    pub zone: Zone,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub state_path: PathBuf,
    pub unit: PriceUnit,
    pub templates: TemplateSet,
    pub bind_addr: String,
}

fn template_key(field: Field) -> &'static str {
    match field {
        Field::Fixing1Rate => "TGE_TEMPLATE_FIXING1_RATE",
        Field::Fixing1Volume => "TGE_TEMPLATE_FIXING1_VOLUME",
        Field::Fixing2Rate => "TGE_TEMPLATE_FIXING2_RATE",
        Field::Fixing2Volume => "TGE_TEMPLATE_FIXING2_VOLUME",
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let fetch_mode = match get("TGE_FETCH_MODE").as_deref().map(str::trim) {
            None | Some("dated") => {
                let url_template = get("TGE_DATA_URL_TEMPLATE")
                    .unwrap_or_else(|| DEFAULT_DATA_URL_TEMPLATE.to_string());
                if !url_template.contains(DATE_PLACEHOLDER) {
                    anyhow::bail!(
                        "TGE_DATA_URL_TEMPLATE must contain {}: {}",
                        DATE_PLACEHOLDER,
                        url_template
                    );
                }
                FetchMode::Dated { url_template }
            }
            Some("current") => FetchMode::Current {
                url: get("TGE_URL").unwrap_or_else(|| DEFAULT_URL.to_string()),
            },
            Some(other) => anyhow::bail!(
                "TGE_FETCH_MODE must be 'dated' or 'current', got '{}'",
                other
            ),
        };

        let zone = match get("TGE_TIMEZONE") {
            Some(name) => parse_timezone(name.trim()).map_err(|e| anyhow::anyhow!("TGE_TIMEZONE: {}", e))?,
            None => Zone::Local,
        };

        let secs = |key: &str, default: u64| -> anyhow::Result<Duration> {
            match get(key) {
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(n) if n > 0 => Ok(Duration::from_secs(n)),
                    _ => Err(anyhow::anyhow!("{} must be a positive number of seconds, got '{}'", key, raw)),
                },
                None => Ok(Duration::from_secs(default)),
            }
        };

        let unit = match get("TGE_UNIT") {
            Some(raw) => PriceUnit::parse(&raw).ok_or_else(|| {
                anyhow::anyhow!("TGE_UNIT must be one of zł/MWh, gr/kWh, zł/kWh, got '{}'", raw)
            })?,
            None => PriceUnit::default(),
        };

        let use_templates = match get("TGE_USE_TEMPLATES").map(|v| v.trim().to_ascii_lowercase()) {
            None => false,
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => anyhow::bail!("TGE_USE_TEMPLATES must be a boolean, got '{}'", v),
        };

        Ok(Config {
            fetch_mode,
            zone,
            http_timeout: secs("TGE_HTTP_TIMEOUT_SECS", 30)?,
            poll_interval: secs("TGE_POLL_INTERVAL_SECS", 60)?,
            state_path: PathBuf::from(
                get("TGE_STATE_PATH").unwrap_or_else(|| DEFAULT_STATE_PATH.to_string()),
            ),
            unit,
            templates: if use_templates {
                load_templates(&get)?
            } else {
                TemplateSet::default()
            },
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }
}

fn load_templates(get: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<TemplateSet> {
    let mut templates = TemplateSet::default();
    let mut errors = Vec::new();

    for field in Field::ALL {
        let source = get(template_key(field)).unwrap_or_default();
        match Template::validate(&source) {
            Ok(template) => {
                if !template.is_empty() {
                    tracing::info!("Template for {}: {}", field.key(), template.source());
                }
                templates.set(field, template);
            }
            Err(e) => errors.push(format!("{} ({}): {}", template_key(field), field.key(), e)),
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Invalid templates: {}", errors.join("; "));
    }
    Ok(templates)
}
