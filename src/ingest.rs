//! Date-by-date ingestion: search, fetch, convert, publish, and mark complete.
//!
//! A date is done when its scene list exists in the bucket. The scene list is
//! written last, after every granule of the date has published all of its
//! files, so its presence always means the whole date is available. Any error
//! abandons the date without writing it; the next run starts that date over.
use crate::convert::{convert_bands, RasterConverter};
use crate::error::{Error, Result};
use crate::fetch::GranuleFetcher;
use crate::index::{write_index, write_scene_list, SceneRecord, INDEX_FILENAME};
use crate::naming::{completion_marker_key, GranuleIdentity, StoragePath};
use crate::products::{ProductCatalog, ProductSpec};
use crate::publish::Publisher;
use crate::search::{GranuleMetadata, GranuleSearch};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Catalog key, e.g. `MCD43A4.006`.
    pub product: String,
    pub prefix: String,
    pub workdir: PathBuf,
    /// Reprocess dates (and granules) that are already published.
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayOutcome {
    /// The scene list already existed.
    Skipped,
    /// Every granule was published and the scene list written.
    Completed { granules: usize },
    /// The search found nothing for this date; nothing was written.
    Empty,
    /// An error stopped the date; nothing marks it complete.
    Abandoned { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayReport {
    pub date: NaiveDate,
    pub outcome: DayOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub days: Vec<DayReport>,
}

impl IngestReport {
    pub fn count(&self, predicate: impl Fn(&DayOutcome) -> bool) -> usize {
        self.days.iter().filter(|d| predicate(&d.outcome)).count()
    }

    pub fn abandoned(&self) -> usize {
        self.count(|o| matches!(o, DayOutcome::Abandoned { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.abandoned() == 0
    }
}

pub struct Ingester<S, C, P> {
    search: S,
    converter: C,
    publisher: P,
    fetcher: GranuleFetcher,
    catalog: ProductCatalog,
    options: IngestOptions,
}

impl<S, C, P> Ingester<S, C, P>
where
    S: GranuleSearch,
    C: RasterConverter,
    P: Publisher,
{
    pub fn new(
        search: S,
        converter: C,
        publisher: P,
        fetcher: GranuleFetcher,
        catalog: ProductCatalog,
        options: IngestOptions,
    ) -> Result<Self> {
        catalog.get(&options.product)?;
        Ok(Self {
            search,
            converter,
            publisher,
            fetcher,
            catalog,
            options,
        })
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Ingest every date in `[start, end)`. A failed date is logged and
    /// reported; the remaining dates still run.
    pub async fn run(&self, start: NaiveDate, end: NaiveDate) -> IngestReport {
        let mut report = IngestReport::default();
        for date in start.iter_days().take_while(|d| *d < end) {
            let outcome = match self.ingest_day(date).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(date = %date, error = %e, "Abandoning date");
                    DayOutcome::Abandoned {
                        error: e.to_string(),
                    }
                }
            };
            report.days.push(DayReport { date, outcome });
        }
        report
    }

    #[instrument(skip(self), fields(product = %self.options.product))]
    pub async fn ingest_day(&self, date: NaiveDate) -> Result<DayOutcome> {
        let product = self.options.product.as_str();
        let marker = completion_marker_key(&self.options.prefix, product, date);

        if self.publisher.exists(&marker).await? {
            if !self.options.overwrite {
                info!(date = %date, "Scenes already processed");
                return Ok(DayOutcome::Skipped);
            }
            self.remove_marker(&marker).await?;
        }

        info!(date = %date, "Processing date");
        let granules = self.granules_for(date).await?;
        if granules.is_empty() {
            info!(date = %date, "No granules found");
            return Ok(DayOutcome::Empty);
        }

        let mut records = Vec::with_capacity(granules.len());
        for granule in granules.iter() {
            records.push(self.ingest_granule(granule).await?);
        }

        fs::create_dir_all(&self.options.workdir).await?;
        let scene_list = self
            .options
            .workdir
            .join(format!("{}_scenes.txt", date.format("%Y-%m-%d")));
        write_scene_list(&scene_list, &records).await?;
        let published = self.publisher.put(&scene_list, &marker).await;
        if let Err(e) = fs::remove_file(&scene_list).await {
            warn!(path = %scene_list.display(), error = %e, "Unable to remove local scene list");
        }
        published?;

        info!(date = %date, granules = records.len(), "End processing date");
        Ok(DayOutcome::Completed {
            granules: records.len(),
        })
    }

    /// Granules whose offset-corrected date is `date`. The search window and the
    /// day offset disagree near window edges, so the search result is filtered again.
    async fn granules_for(&self, date: NaiveDate) -> Result<Vec<GranuleMetadata>> {
        let spec = self.catalog.get(&self.options.product)?;
        let found = self.search.search(date, date, &self.options.product).await?;
        let total = found.len();
        let mut granules = vec![];
        for granule in found {
            if spec.shift(granule.start_date()?)? == date {
                granules.push(granule);
            }
        }
        if granules.len() != total {
            info!(
                date = %date,
                kept = granules.len(),
                dropped = total - granules.len(),
                "Filtered granules by corrected date"
            );
        }
        Ok(granules)
    }

    /// Fetch, convert, and publish one granule. Local files are deleted as soon
    /// as they are uploaded.
    #[instrument(skip(self, granule), fields(granule = %granule.id))]
    pub async fn ingest_granule(&self, granule: &GranuleMetadata) -> Result<SceneRecord> {
        let url = granule.access_url().ok_or_else(|| Error::Fetch {
            granule: granule.id.clone(),
            link_type: "data".to_string(),
        })?;
        let identity = GranuleIdentity::parse(url, &self.catalog)?;
        let spec = self.catalog.get(&identity.product)?;
        let path = identity.storage_path(&self.options.prefix);

        let record = SceneRecord {
            corrected_date: identity.corrected_date(spec)?,
            granule_id: identity.granule_id.clone(),
            index_url: self.publisher.public_url(&path.key(INDEX_FILENAME)),
        };

        if !self.options.overwrite && self.is_published(&path, spec).await? {
            info!(gid = %identity.granule_id, path = %path, "Granule already published");
            return Ok(record);
        }

        let started = Instant::now();
        info!(gid = %identity.granule_id, "Processing granule");
        let dir = self.options.workdir.join(&identity.granule_id);
        let result = self.process(granule, spec, &path, &dir).await;
        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "Unable to clean up work directory");
            }
        }
        result?;

        info!(
            gid = %identity.granule_id,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Completed granule"
        );
        Ok(record)
    }

    async fn process(
        &self,
        granule: &GranuleMetadata,
        spec: &ProductSpec,
        path: &StoragePath,
        dir: &Path,
    ) -> Result<()> {
        info!("Downloading granule");
        let fetched = self.fetcher.fetch(granule, dir).await?;

        info!("Converting granule to GeoTIFFs");
        let mut files = convert_bands(&self.converter, &fetched.raw, spec, dir).await?;
        files.push(fetched.metadata_json.clone());
        files.push(fetched.metadata_xml.clone());

        let product = file_name(&fetched.raw);
        let index = write_index(dir, &fetched.browse, &product, &files).await?;
        files.push(index);
        files.push(fetched.browse.clone());

        info!(path = %path, files = files.len(), "Uploading granule");
        for file in files.iter() {
            self.publisher.put(file, &path.key(&file_name(file))).await?;
            fs::remove_file(file).await?;
        }

        fs::remove_file(&fetched.raw).await?;
        fs::remove_dir(dir).await.ok();
        Ok(())
    }

    async fn is_published(&self, path: &StoragePath, spec: &ProductSpec) -> Result<bool> {
        let published = self.publisher.list(&format!("{path}/")).await?;
        Ok(published.len() >= spec.artifact_count())
    }

    async fn remove_marker(&self, marker: &str) -> Result<()> {
        warn!(key = marker, "Overwriting processed date, removing scene list");
        for uri in self.publisher.list(marker).await? {
            if uri.ends_with(marker) {
                self.publisher.delete(&uri).await?;
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
