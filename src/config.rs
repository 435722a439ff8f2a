use std::{
    collections::{HashMap, HashSet},
    fs,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::{aggregator::AggregatorError, chart::ChartConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Overridden by `--base-url`.
    pub base_url: Option<String>,
    /// Request name -> URL template relative to the base URL.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    pub charts: Vec<ChartConfig>,
    #[serde(default)]
    pub tz_offset_seconds: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no charts configured")]
    NoCharts,
    #[error("duplicate chart id `{0}`")]
    DuplicateChart(String),
    #[error("chart `{chart}` uses request `{request}` which has no endpoint")]
    UnknownEndpoint { chart: String, request: String },
    #[error("chart `{chart}` has an invalid load group: {source}")]
    InvalidChart { chart: String, source: AggregatorError },
    #[error("no base url: set `base_url` in the config or pass --base-url")]
    MissingBaseUrl,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.charts.is_empty() {
            return Err(ConfigError::NoCharts);
        }
        let mut seen = HashSet::new();
        for c in &self.charts {
            if !seen.insert(c.id.as_str()) {
                return Err(ConfigError::DuplicateChart(c.id.clone()));
            }
            c.load_group.validate().map_err(|source| ConfigError::InvalidChart {
                chart: c.id.clone(),
                source,
            })?;
            if !self.endpoints.contains_key(&c.load_group.name) {
                return Err(ConfigError::UnknownEndpoint {
                    chart: c.id.clone(),
                    request: c.load_group.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn base_url<'a>(&'a self, cli: Option<&'a str>) -> Result<&'a str, ConfigError> {
        cli.or(self.base_url.as_deref()).ok_or(ConfigError::MissingBaseUrl)
    }
}

pub fn parse_config(text: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(text).context("parse config json")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &str) -> Result<Config> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path))?;
    parse_config(&text).with_context(|| format!("load config {}", path))
}
