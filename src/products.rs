//! Per-product band layout and date correction.
use crate::error::{Error, Result};
use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_PRODUCT: &str = "MCD43A4.006";

/// Largest accepted `day_offset`, in either direction.
pub const MAX_DAY_OFFSET: i64 = 366;

// MCD43A4 publishes the first day of a 16 day compositing window; +8 moves it to the center.
const DEFAULT_PRODUCTS_TOML: &str = r#"
["MCD43A4.006"]
day_offset = 8
band_names = [
    "B01qa", "B02qa", "B03qa", "B04qa", "B05qa", "B06qa", "B07qa",
    "B01", "B02", "B03", "B04", "B05", "B06", "B07",
]
overviews = [
    false, false, false, false, false, false, false,
    true, true, true, true, true, true, true,
]
"#;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ProductSpec {
    pub day_offset: i64,
    pub band_names: Vec<String>,
    /// Aligned with `band_names`: whether to build an external `.ovr` for that band.
    pub overviews: Vec<bool>,
}

impl ProductSpec {
    /// Number of objects a fully published granule of this product holds: every band,
    /// every overview sidecar, plus metadata json, metadata xml, browse image and index.html.
    pub fn artifact_count(&self) -> usize {
        self.band_names.len() + self.overviews.iter().filter(|o| **o).count() + 4
    }

    /// `date` moved by `day_offset`, e.g. from a window start to its center.
    pub fn shift(&self, date: NaiveDate) -> Result<NaiveDate> {
        TimeDelta::try_days(self.day_offset)
            .and_then(|offset| date.checked_add_signed(offset))
            .ok_or_else(|| {
                Error::Config(format!("day_offset {} overflows {date}", self.day_offset))
            })
    }

    fn validate(&self, key: &str) -> Result<()> {
        if self.day_offset.abs() > MAX_DAY_OFFSET {
            return Err(Error::Config(format!(
                "product {key} day_offset {} is outside -{MAX_DAY_OFFSET}..={MAX_DAY_OFFSET}",
                self.day_offset
            )));
        }
        if self.band_names.is_empty() {
            return Err(Error::Config(format!("product {key} has no bands")));
        }
        if self.band_names.len() != self.overviews.len() {
            return Err(Error::Config(format!(
                "product {key} has {} band names but {} overview flags",
                self.band_names.len(),
                self.overviews.len()
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(transparent)]
pub struct ProductCatalog {
    products: BTreeMap<String, ProductSpec>,
}

impl ProductCatalog {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::parse(DEFAULT_PRODUCTS_TOML)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let catalog: Self = toml::from_str(content)?;
        for (key, spec) in catalog.products.iter() {
            spec.validate(key)?;
        }
        Ok(catalog)
    }

    /// Product `key` is `{short_name}.{version}`, e.g. `MCD43A4.006`.
    pub fn get(&self, key: &str) -> Result<&ProductSpec> {
        self.products
            .get(key)
            .ok_or_else(|| Error::Config(format!("unknown product {key}")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.products.contains_key(key)
    }
}
