//! Runtime configuration, read once at start-up and passed down explicitly.
use crate::error::{Error, Result};
use crate::naming::julian_to_date;
use chrono::NaiveDate;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUCKET: &str = "modis-pds";
pub const DEFAULT_CMR_URL: &str = "https://cmr.earthdata.nasa.gov";
pub const DEFAULT_PROVIDER: &str = "LPDAAC_ECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bucket: String,
    pub earthdata: Option<Credentials>,
    pub cmr_url: String,
    pub provider: String,
    pub aws_profile: Option<String>,
    pub aws_region: Option<String>,
    /// S3-compatible endpoint override, e.g. a local MinIO.
    pub s3_endpoint: Option<String>,
    /// Prepended to every published key; empty in production.
    pub prefix: String,
    /// Scratch directory for downloads and derived files.
    pub workdir: PathBuf,
    pub retry: RetryPolicy,
    pub max_redirects: usize,
    /// Directory of the GDAL utilities; `None` uses `PATH`.
    pub gdal_bin: Option<PathBuf>,
}

/// Retry policy applied to every HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            earthdata: None,
            cmr_url: DEFAULT_CMR_URL.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            aws_profile: None,
            aws_region: None,
            s3_endpoint: None,
            prefix: String::new(),
            workdir: env::temp_dir().join("modis-pds"),
            retry: RetryPolicy::default(),
            max_redirects: 10,
            gdal_bin: None,
        }
    }
}

impl Config {
    /// Build from the process environment. A `.env` file, if present, is loaded first.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let earthdata = match (lookup("EARTHDATA_USER"), lookup("EARTHDATA_PASS")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "EARTHDATA_USER and EARTHDATA_PASS must be set together".to_string(),
                ))
            }
        };

        Ok(Self {
            bucket: lookup("BUCKET").unwrap_or(defaults.bucket),
            earthdata,
            cmr_url: lookup("CMR_URL").unwrap_or(defaults.cmr_url),
            provider: lookup("PROVIDER").unwrap_or(defaults.provider),
            aws_profile: lookup("AWS_PROFILE"),
            aws_region: lookup("AWS_REGION"),
            s3_endpoint: lookup("S3_ENDPOINT"),
            gdal_bin: lookup("GDAL_BIN").map(PathBuf::from),
            ..defaults
        })
    }

    /// Earthdata credentials, required for the authenticated downloads.
    pub fn credentials(&self) -> Result<&Credentials> {
        self.earthdata.as_ref().ok_or_else(|| {
            Error::Config("EARTHDATA_USER / EARTHDATA_PASS are not set".to_string())
        })
    }
}

/// Parse a command line date: `YYYY-MM-DD`, `YYYY/MM/DD`, `YYYYMMDD` or julian `YYYYDDD`.
pub fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    let value = value.trim();
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Ok(date);
        }
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        let parsed = match value.len() {
            8 => match (value[..4].parse(), value[4..6].parse(), value[6..].parse()) {
                (Ok(y), Ok(m), Ok(d)) => NaiveDate::from_ymd_opt(y, m, d),
                _ => None,
            },
            7 => julian_to_date(value).ok(),
            _ => None,
        };
        if let Some(date) = parsed {
            return Ok(date);
        }
    }
    Err(format!(
        "unrecognised date '{value}', expected YYYY-MM-DD, YYYY/MM/DD, YYYYMMDD or YYYYDDD"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bucket, DEFAULT_BUCKET);
        assert_eq!(config.provider, DEFAULT_PROVIDER);
        assert!(config.earthdata.is_none());
        assert!(config.credentials().is_err());
        assert_eq!(config.max_redirects, 10);
    }

    #[test]
    fn test_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("BUCKET", "my-bucket"),
            ("EARTHDATA_USER", "user"),
            ("EARTHDATA_PASS", "secret"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("GDAL_BIN", "/opt/gdal/bin"),
        ]))
        .unwrap();
        assert_eq!(config.bucket, "my-bucket");
        assert_eq!(config.credentials().unwrap().username, "user");
        assert_eq!(config.s3_endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.gdal_bin, Some(PathBuf::from("/opt/gdal/bin")));
    }

    #[test]
    fn test_partial_credentials() {
        let result = Config::from_lookup(lookup(&[("EARTHDATA_USER", "user")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_parse_date() {
        let expected = NaiveDate::from_ymd_opt(2016, 2, 1).unwrap();
        for value in ["2016-02-01", "2016/02/01", "20160201", "2016032", " 2016-02-01 "] {
            assert_eq!(parse_date(value).unwrap(), expected, "{value}");
        }
        assert!(parse_date("01-02-2016").is_err());
        assert!(parse_date("2016-02-30").is_err());
        assert!(parse_date("yesterday").is_err());
    }
}
