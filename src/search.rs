//! Granule discovery through NASA's Common Metadata Repository (CMR).
use crate::error::{Error, Result};
use crate::transport::Transport;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

pub const METADATA_XML_TYPE: &str = "text/xml";
pub const BROWSE_TYPE: &str = "image/jpeg";

const PAGE_SIZE: usize = 2000;

/// One granule entry as returned by the search API. Fields not modelled here are
/// kept in `extra` so the record can be written back out in full.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GranuleMetadata {
    pub id: String,
    pub title: String,
    pub time_start: String,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Link {
    pub href: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GranuleMetadata {
    /// The primary data file. CMR lists it first.
    pub fn access_url(&self) -> Option<&str> {
        self.links.first().map(|l| l.href.as_str())
    }

    /// First sidecar link (anything after the primary) with the given MIME type.
    pub fn link(&self, mime_type: &str) -> Option<&str> {
        self.links
            .iter()
            .skip(1)
            .find(|l| l.mime_type.as_deref() == Some(mime_type))
            .map(|l| l.href.as_str())
    }

    /// Calendar date of `time_start`, i.e. the first day of the compositing window.
    pub fn start_date(&self) -> Result<NaiveDate> {
        let date = self.time_start.split('T').next().unwrap_or_default();
        NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|e| {
            Error::Search(format!(
                "granule {} has invalid time_start '{}': {e}",
                self.id, self.time_start
            ))
        })
    }
}

pub trait GranuleSearch {
    /// All granules of `product` (`{short_name}.{version}`) whose temporal extent
    /// intersects `[start 00:00, end 23:59]`.
    async fn search(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        product: &str,
    ) -> Result<Vec<GranuleMetadata>>;
}

#[derive(Deserialize)]
struct SearchResponse {
    feed: Feed,
}

#[derive(Deserialize)]
struct Feed {
    #[serde(default)]
    entry: Vec<GranuleMetadata>,
}

#[derive(Debug, Clone)]
pub struct CmrClient {
    transport: Transport,
    base_url: String,
    provider: String,
    page_size: usize,
}

impl CmrClient {
    pub fn new(transport: Transport, base_url: &str, provider: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            provider: provider.to_string(),
            page_size: PAGE_SIZE,
        }
    }

    /// Entries requested per page, at least one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn fetch_page(
        &self,
        short_name: &str,
        version: &str,
        temporal: &str,
        page_num: usize,
    ) -> Result<Vec<GranuleMetadata>> {
        let url = format!("{}/search/granules.json", self.base_url);
        let page_size = self.page_size.to_string();
        let page_num = page_num.to_string();
        let request = self.transport.client().get(&url).query(&[
            ("provider", self.provider.as_str()),
            ("short_name", short_name),
            ("version", version),
            ("temporal", temporal),
            ("online_only", "true"),
            ("sort_key", "start_date"),
            ("page_size", page_size.as_str()),
            ("page_num", page_num.as_str()),
        ]);

        let response = self.transport.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Search(format!("CMR returned HTTP {status}: {body}")));
        }
        let page: SearchResponse = response.json().await?;
        Ok(page.feed.entry)
    }
}

impl GranuleSearch for CmrClient {
    async fn search(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        product: &str,
    ) -> Result<Vec<GranuleMetadata>> {
        let (short_name, version) = product
            .split_once('.')
            .ok_or_else(|| Error::Config(format!("product {product} is not SHORTNAME.VERSION")))?;
        let temporal = format!("{start}T00:00:00Z,{end}T23:59:00Z");

        let mut granules = vec![];
        for page_num in 1.. {
            let page = self
                .fetch_page(short_name, version, &temporal, page_num)
                .await?;
            debug!(page = page_num, entries = page.len(), "CMR page");
            let last = page.len() < self.page_size;
            granules.extend(page);
            if last {
                break;
            }
        }

        info!(
            product = product,
            start = %start,
            end = %end,
            count = granules.len(),
            "Granules found"
        );
        Ok(granules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(id: u32, time_start: &str) -> Value {
        json!({
            "id": format!("G{id}-LPDAAC_ECS"),
            "title": format!("SC:MCD43A4.006:{id}"),
            "time_start": time_start,
            "producer_granule_id": format!("MCD43A4.A2016001.h{id:02}v07.006.2016174075640.hdf"),
            "links": [
                {"rel": "http://esipfed.org/ns/fedsearch/1.1/data#", "href": format!("https://e4ftl01.cr.usgs.gov/MOTA/MCD43A4.A2016001.h{id:02}v07.006.2016174075640.hdf")},
                {"rel": "http://esipfed.org/ns/fedsearch/1.1/browse#", "type": "image/jpeg", "href": format!("https://e4ftl01.cr.usgs.gov/WORKING/BRWS/BROWSE.MCD43A4.A2016001.h{id:02}v07.006.1.jpg")},
                {"rel": "http://esipfed.org/ns/fedsearch/1.1/metadata#", "type": "text/xml", "href": format!("https://e4ftl01.cr.usgs.gov/MOTA/MCD43A4.A2016001.h{id:02}v07.006.2016174075640.hdf.xml")}
            ]
        })
    }

    fn client(server: &MockServer) -> CmrClient {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_base: std::time::Duration::from_millis(1),
        };
        CmrClient::new(Transport::new(policy).unwrap(), &server.uri(), "LPDAAC_ECS")
    }

    #[tokio::test]
    async fn test_search_pages() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/granules.json"))
            .and(query_param("short_name", "MCD43A4"))
            .and(query_param("version", "006"))
            .and(query_param("temporal", "2016-01-01T00:00:00Z,2016-01-01T23:59:00Z"))
            .and(query_param("page_num", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feed": {"entry": [entry(1, "2015-12-24T00:00:00.000Z"), entry(2, "2015-12-24T00:00:00.000Z")]}
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search/granules.json"))
            .and(query_param("page_num", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feed": {"entry": [entry(3, "2015-12-24T00:00:00.000Z")]}
            })))
            .mount(&mock_server)
            .await;

        let date = NaiveDate::from_ymd_opt(2016, 1, 1).unwrap();
        let granules = client(&mock_server)
            .with_page_size(2)
            .search(date, date, "MCD43A4.006")
            .await
            .unwrap();

        assert_eq!(granules.len(), 3);
        assert_eq!(granules[2].id, "G3-LPDAAC_ECS");
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_page_size_still_terminates() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page_size", "1"))
            .and(query_param("page_num", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "feed": {"entry": [entry(1, "2015-12-24T00:00:00.000Z")]}
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page_num", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"feed": {"entry": []}})))
            .mount(&mock_server)
            .await;

        let date = NaiveDate::from_ymd_opt(2016, 1, 1).unwrap();
        let granules = client(&mock_server)
            .with_page_size(0)
            .search(date, date, "MCD43A4.006")
            .await
            .unwrap();

        assert_eq!(granules.len(), 1);
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad temporal"))
            .mount(&mock_server)
            .await;

        let date = NaiveDate::from_ymd_opt(2016, 1, 1).unwrap();
        let result = client(&mock_server).search(date, date, "MCD43A4.006").await;
        assert!(matches!(result, Err(Error::Search(msg)) if msg.contains("bad temporal")));
    }

    #[test]
    fn test_links_and_dates() {
        let granule: GranuleMetadata =
            serde_json::from_value(entry(11, "2015-12-24T00:00:00.000Z")).unwrap();

        assert!(granule.access_url().unwrap().ends_with(".hdf"));
        assert!(granule.link(METADATA_XML_TYPE).unwrap().ends_with(".hdf.xml"));
        assert!(granule.link(BROWSE_TYPE).unwrap().ends_with(".jpg"));
        assert_eq!(granule.link("application/x-hdfeos"), None);
        assert_eq!(
            granule.start_date().unwrap(),
            NaiveDate::from_ymd_opt(2015, 12, 24).unwrap()
        );
        assert!(granule.extra.contains_key("producer_granule_id"));
    }

    #[test]
    fn test_metadata_round_trips_unknown_fields() {
        let value = entry(5, "2016-01-01T00:00:00.000Z");
        let granule: GranuleMetadata = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&granule).unwrap(), value);
    }
}
