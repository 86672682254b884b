use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Credential exchange failed or the redirect chain ended in a non-success status.
    #[error("Earthdata authentication error at {url}: HTTP {status}")]
    Authentication { url: String, status: u16 },

    #[error("Redirect chain from {url} exceeded {hops} hops without terminating")]
    RedirectLoop { url: String, hops: usize },

    #[error("Granule {granule} has no link of type '{link_type}'")]
    Fetch { granule: String, link_type: String },

    #[error("Malformed granule filename '{filename}': {reason}")]
    Format { filename: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Retries exhausted, or a request failed in a way that is not worth retrying.
    #[error("Request to {url} failed after {attempts} attempt(s): {reason}")]
    Transport {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Raster conversion failed: {0}")]
    Conversion(String),

    #[error("Object store error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn format(filename: &str, reason: impl Into<String>) -> Self {
        Self::Format {
            filename: filename.to_string(),
            reason: reason.into(),
        }
    }
}
