//! Granule identity and storage layout derived from MODIS filenames.
//!
//! Filenames have the fixed positional form
//! `{product}.A{YYYYDDD}.h{row}v{col}.{version}.{processing}.hdf`, for example
//! `MCD43A4.A2015266.h12v07.006.2016168081200.hdf`.
use crate::error::{Error, Result};
use crate::products::{ProductCatalog, ProductSpec};
use chrono::NaiveDate;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static TILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^h(?<row>\d+)v(?<col>\d+)$").expect("Regex pattern should always compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleIdentity {
    /// Filename without directory or `.hdf` extension.
    pub granule_id: String,
    /// Catalog key, `{product}.{version}`.
    pub product: String,
    pub tile_row: String,
    pub tile_col: String,
    /// `YYYYDDD` as it appears in the filename.
    pub julian_date: String,
}

impl GranuleIdentity {
    pub fn parse(filename: &str, catalog: &ProductCatalog) -> Result<Self> {
        let basename = filename.rsplit('/').next().unwrap_or(filename);
        let granule_id = basename.strip_suffix(".hdf").unwrap_or(basename);

        let tokens: Vec<&str> = granule_id.split('.').collect();
        let [short_name, date_token, tile_token, version, _processing] = tokens[..] else {
            return Err(Error::format(
                filename,
                format!("expected 5 dot separated tokens, found {}", tokens.len()),
            ));
        };

        let product = format!("{short_name}.{version}");
        if !catalog.contains(&product) {
            return Err(Error::format(filename, format!("unconfigured product {product}")));
        }

        let julian_date = date_token
            .strip_prefix('A')
            .filter(|d| d.len() == 7 && d.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| Error::format(filename, format!("bad date token '{date_token}'")))?;

        let captures = TILE_RE
            .captures(tile_token)
            .ok_or_else(|| Error::format(filename, format!("bad tile token '{tile_token}'")))?;
        let (_, [tile_row, tile_col]) = captures.extract();

        Ok(Self {
            granule_id: granule_id.to_string(),
            product,
            tile_row: tile_row.to_string(),
            tile_col: tile_col.to_string(),
            julian_date: julian_date.to_string(),
        })
    }

    /// Calendar date encoded in the filename (first day of the compositing window).
    pub fn acquisition_date(&self) -> Result<NaiveDate> {
        julian_to_date(&self.julian_date)
    }

    /// Acquisition date shifted by the product's `day_offset`.
    pub fn corrected_date(&self, spec: &ProductSpec) -> Result<NaiveDate> {
        spec.shift(self.acquisition_date()?)
    }

    pub fn storage_path(&self, prefix: &str) -> StoragePath {
        let path = format!(
            "{}/{}/{}/{}",
            self.product, self.tile_row, self.tile_col, self.julian_date
        );
        StoragePath(with_prefix(prefix, &path))
    }
}

/// Key prefix under which every artifact of one granule is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePath(String);

impl StoragePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn key(&self, filename: &str) -> String {
        format!("{}/{}", self.0, filename)
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of the per-date scene list whose existence marks the date as fully ingested.
pub fn completion_marker_key(prefix: &str, product: &str, date: NaiveDate) -> String {
    with_prefix(prefix, &format!("{}/{}_scenes.txt", product, date.format("%Y-%m-%d")))
}

pub fn julian_to_date(julian: &str) -> Result<NaiveDate> {
    let invalid = || Error::format(julian, "not a YYYYDDD julian date");
    if julian.len() != 7 {
        return Err(invalid());
    }
    let year: i32 = julian[..4].parse().map_err(|_| invalid())?;
    let ordinal: u32 = julian[4..].parse().map_err(|_| invalid())?;
    NaiveDate::from_yo_opt(year, ordinal).ok_or_else(invalid)
}

fn with_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}
