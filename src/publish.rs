//! Publishing derived files to S3 with public read access.
use crate::config::Config;
use crate::error::{Error, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

const DEFAULT_REGION: &str = "us-east-1";

static S3_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^s3://(?<bucket>[\w.-]+)/(?<key>.+)$").expect("Regex pattern should always compile")
});

pub trait Publisher {
    /// Upload the local file at `path` to `key`, returning its `s3://` URI.
    async fn put(&self, path: &Path, key: &str) -> Result<String>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// URIs of every object under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, uri: &str) -> Result<()>;

    /// Anonymous HTTPS URL of `key`.
    fn public_url(&self, key: &str) -> String;
}

#[derive(Debug, PartialEq)]
pub struct S3Uri {
    pub bucket: String,
    pub key: String,
}

impl S3Uri {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let captures = S3_URI_RE
            .captures(uri)
            .ok_or_else(|| Error::Storage(format!("not an s3:// object URI: {uri}")))?;
        let (_, [bucket, key]) = captures.extract();

        Ok(Self::new(bucket, key))
    }
}

impl std::fmt::Display for S3Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Content type for an uploaded file, by extension.
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "text/xml",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "binary/octet-stream",
    }
}

/// Build an S3 client from the configured profile, region and optional endpoint.
pub async fn client_from_config(config: &Config) -> Client {
    let region = RegionProviderChain::first_try(config.aws_region.clone().map(Region::new))
        .or_default_provider()
        .or_else(Region::new(DEFAULT_REGION));

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
    if let Some(profile) = &config.aws_profile {
        loader = loader.profile_name(profile);
    }
    let base_config = loader.load().await;

    let mut s3_config = aws_sdk_s3::config::Builder::from(&base_config);
    if let Some(endpoint) = &config.s3_endpoint {
        s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
    }

    Client::from_conf(s3_config.build())
}

#[derive(Debug, Clone)]
pub struct S3Publisher {
    client: Client,
    bucket: String,
}

impl S3Publisher {
    pub fn new(client: Client, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }

    pub async fn from_config(config: &Config) -> Self {
        let client = client_from_config(config).await;
        Self::new(client, &config.bucket)
    }
}

impl Publisher for S3Publisher {
    async fn put(&self, path: &Path, key: &str) -> Result<String> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::Storage(format!("unable to read {}: {e}", path.display())))?;

        info!(bucket = %self.bucket, key = key, "Uploading");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .acl(ObjectCannedAcl::PublicRead)
            .content_type(content_type(path))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("put {key}: {}", e.into_service_error())))?;

        Ok(S3Uri::new(&self.bucket, key).to_string())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = e.into_service_error();
                if e.is_not_found() {
                    Ok(false)
                } else {
                    Err(Error::Storage(format!("head {key}: {e}")))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut uris = vec![];
        while let Some(page) = pages.next().await {
            let page = page
                .map_err(|e| Error::Storage(format!("list {prefix}: {}", e.into_service_error())))?;
            uris.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(|key| S3Uri::new(&self.bucket, key).to_string()),
            );
        }
        debug!(prefix = prefix, count = uris.len(), "Listed objects");
        Ok(uris)
    }

    async fn delete(&self, uri: &str) -> Result<()> {
        let object = S3Uri::parse(uri)?;
        self.client
            .delete_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("delete {uri}: {}", e.into_service_error())))?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://{}.s3.amazonaws.com/{}", self.bucket, key)
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryPublisher;
    use super::*;

    #[test]
    fn test_s3_uri_from_string() {
        let uri = "s3://modis-pds/MCD43A4.006/12/07/2015266/index.html";
        let object = S3Uri::parse(uri).unwrap();
        assert_eq!(
            object,
            S3Uri {
                bucket: "modis-pds".to_string(),
                key: "MCD43A4.006/12/07/2015266/index.html".to_string(),
            }
        );
        assert_eq!(object.to_string(), uri);
        assert!(S3Uri::parse("https://modis-pds.s3.amazonaws.com/x").is_err());
        assert!(S3Uri::parse("s3://modis-pds/").is_err());
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("index.html")), "text/html");
        assert_eq!(content_type(Path::new("x_meta.json")), "application/json");
        assert_eq!(content_type(Path::new("2016-01-01_scenes.txt")), "text/plain");
        assert_eq!(content_type(Path::new("x.hdf.xml")), "text/xml");
        assert_eq!(content_type(Path::new("BROWSE.x.jpg")), "image/jpeg");
        assert_eq!(content_type(Path::new("x_B01.TIF")), "binary/octet-stream");
        assert_eq!(content_type(Path::new("x_B01.TIF.ovr")), "binary/octet-stream");
    }

    #[tokio::test]
    async fn test_memory_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.html");
        std::fs::write(&file, "<html/>").unwrap();

        let publisher = MemoryPublisher::default();
        let uri = publisher.put(&file, "a/b/index.html").await.unwrap();
        assert_eq!(uri, "s3://memory/a/b/index.html");
        assert!(publisher.exists("a/b/index.html").await.unwrap());
        assert_eq!(publisher.list("a/").await.unwrap(), vec![uri.clone()]);

        publisher.delete(&uri).await.unwrap();
        assert!(!publisher.exists("a/b/index.html").await.unwrap());
    }
}
