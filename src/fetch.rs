use crate::config::Credentials;
use crate::download::{basename, Downloader};
use crate::error::{Error, Result};
use crate::search::{GranuleMetadata, BROWSE_TYPE, METADATA_XML_TYPE};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Local files of one downloaded granule.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedGranule {
    pub raw: PathBuf,
    pub browse: PathBuf,
    pub metadata_json: PathBuf,
    pub metadata_xml: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GranuleFetcher {
    downloader: Downloader,
    credentials: Option<Credentials>,
}

impl GranuleFetcher {
    pub fn new(downloader: Downloader, credentials: Option<Credentials>) -> Self {
        Self {
            downloader,
            credentials,
        }
    }

    /// Download the data file and its sidecars into `output_dir`.
    ///
    /// The search record is always written to `{basename}_meta.json` first, so
    /// it is on disk even when a link turns out to be missing.
    pub async fn fetch(&self, granule: &GranuleMetadata, output_dir: &Path) -> Result<FetchedGranule> {
        let url = granule.access_url().ok_or_else(|| missing(granule, "data"))?;
        let filename = basename(url)?;
        let stem = Path::new(&filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename.as_str());

        fs::create_dir_all(output_dir).await?;
        let metadata_json = output_dir.join(format!("{stem}_meta.json"));
        debug!(path = %metadata_json.display(), "Writing metadata");
        fs::write(&metadata_json, serde_json::to_vec_pretty(granule)?).await?;

        let xml_url = granule
            .link(METADATA_XML_TYPE)
            .ok_or_else(|| missing(granule, METADATA_XML_TYPE))?;
        let browse_url = granule
            .link(BROWSE_TYPE)
            .ok_or_else(|| missing(granule, BROWSE_TYPE))?;

        let credentials = self.credentials.as_ref();
        let raw = self.downloader.download(url, credentials, output_dir).await?;
        let metadata_xml = self
            .downloader
            .download(xml_url, credentials, output_dir)
            .await?;
        // Browse images are public.
        let browse = self.downloader.download(browse_url, None, output_dir).await?;

        Ok(FetchedGranule {
            raw,
            browse,
            metadata_json,
            metadata_xml,
        })
    }
}

fn missing(granule: &GranuleMetadata, link_type: &str) -> Error {
    Error::Fetch {
        granule: granule.id.clone(),
        link_type: link_type.to_string(),
    }
}
