//! Splitting a multi-band granule into single-band compressed GeoTIFFs.
//!
//! The raster work itself is delegated to GDAL's command line utilities.
use crate::error::{Error, Result};
use crate::products::ProductSpec;
use serde_json::Value;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::process::Command;
use tracing::debug;

const OVERVIEW_LEVELS: [&str; 4] = ["2", "4", "8", "16"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOptions {
    pub compression: String,
    pub predictor: u8,
    pub tiled: bool,
    pub block_size: u32,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            compression: "DEFLATE".to_string(),
            predictor: 2,
            tiled: true,
            block_size: 512,
        }
    }
}

impl ConversionOptions {
    /// GTiff creation options, as `KEY=VALUE` pairs.
    pub fn creation_options(&self) -> Vec<String> {
        let mut options = vec![
            format!("COMPRESS={}", self.compression),
            format!("PREDICTOR={}", self.predictor),
        ];
        if self.tiled {
            options.push("TILED=YES".to_string());
            options.push(format!("BLOCKXSIZE={}", self.block_size));
            options.push(format!("BLOCKYSIZE={}", self.block_size));
        }
        options
    }
}

pub trait RasterConverter {
    /// Write band `band_index` (0-based) of `input` to `output` as a GeoTIFF.
    async fn convert(
        &self,
        input: &Path,
        band_index: usize,
        output: &Path,
        options: &ConversionOptions,
    ) -> Result<PathBuf>;

    /// Build an external overview for `path`, returning the `.ovr` sidecar.
    async fn add_overviews(&self, path: &Path) -> Result<PathBuf>;
}

/// Converts every configured band of `raw`, returning the written files in band
/// order, each band followed by its `.ovr` when the product asks for one.
pub async fn convert_bands(
    converter: &impl RasterConverter,
    raw: &Path,
    spec: &ProductSpec,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let stem = raw
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Conversion(format!("bad input path {}", raw.display())))?;
    let options = ConversionOptions::default();

    let mut files = vec![];
    for (index, (band, overview)) in spec.band_names.iter().zip(&spec.overviews).enumerate() {
        let output = output_dir.join(format!("{stem}_{band}.TIF"));
        debug!(path = %output.display(), band = index, "Writing band");
        let written = converter.convert(raw, index, &output, &options).await?;
        files.push(written.clone());
        if *overview {
            files.push(converter.add_overviews(&written).await?);
        }
    }
    Ok(files)
}

/// `gdalinfo` / `gdal_translate` / `gdaladdo` from the host's GDAL install.
#[derive(Debug, Default)]
pub struct GdalTools {
    /// Directory holding the GDAL binaries; `None` searches `PATH`.
    bin_dir: Option<PathBuf>,
    /// Subdatasets of the last inspected input, reused across its bands.
    last_input: Mutex<Option<(PathBuf, Vec<String>)>>,
}

impl GdalTools {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self {
            bin_dir,
            last_input: Mutex::new(None),
        }
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    async fn run(&self, name: &str, args: Vec<OsString>) -> Result<Vec<u8>> {
        let program = self.program(name);
        let output = Command::new(&program)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Conversion(format!("unable to run {}: {e}", program.display())))?;
        if !output.status.success() {
            return Err(Error::Conversion(format!(
                "{name} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    /// HDF-EOS granules expose their bands as subdatasets; plain rasters have none.
    /// `gdalinfo` runs once per input file.
    async fn subdatasets(&self, input: &Path) -> Result<Vec<String>> {
        let cached = self
            .cached()
            .as_ref()
            .filter(|(path, _)| path == input)
            .map(|(_, names)| names.clone());
        if let Some(names) = cached {
            return Ok(names);
        }

        let stdout = self.run("gdalinfo", vec!["-json".into(), input.into()]).await?;
        let info: Value = serde_json::from_slice(&stdout)?;
        let names = subdataset_names(&info);
        *self.cached() = Some((input.to_path_buf(), names.clone()));
        Ok(names)
    }

    fn cached(&self) -> MutexGuard<'_, Option<(PathBuf, Vec<String>)>> {
        self.last_input
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RasterConverter for GdalTools {
    async fn convert(
        &self,
        input: &Path,
        band_index: usize,
        output: &Path,
        options: &ConversionOptions,
    ) -> Result<PathBuf> {
        let subdatasets = self.subdatasets(input).await?;

        let mut args: Vec<OsString> = vec![];
        if subdatasets.is_empty() {
            args.push("-b".into());
            args.push((band_index + 1).to_string().into());
            args.push(input.into());
        } else {
            let name = subdatasets.get(band_index).ok_or_else(|| {
                Error::Conversion(format!(
                    "{} has {} subdatasets, band {band_index} requested",
                    input.display(),
                    subdatasets.len()
                ))
            })?;
            args.push(name.into());
        }
        args.push(output.into());
        for option in options.creation_options() {
            args.push("-co".into());
            args.push(option.into());
        }

        self.run("gdal_translate", args).await?;
        Ok(output.to_path_buf())
    }

    async fn add_overviews(&self, path: &Path) -> Result<PathBuf> {
        let mut args: Vec<OsString> = vec![
            "-ro".into(),
            "--config".into(),
            "COMPRESS_OVERVIEW".into(),
            "DEFLATE".into(),
            path.into(),
        ];
        args.extend(OVERVIEW_LEVELS.into_iter().map(OsString::from));

        self.run("gdaladdo", args).await?;
        let mut ovr = path.as_os_str().to_owned();
        ovr.push(".ovr");
        Ok(PathBuf::from(ovr))
    }
}

/// `SUBDATASET_{n}_NAME` entries of `gdalinfo -json` output, ordered by `n`.
fn subdataset_names(info: &Value) -> Vec<String> {
    let Some(entries) = info
        .pointer("/metadata/SUBDATASETS")
        .and_then(Value::as_object)
    else {
        return vec![];
    };

    let mut names: Vec<(usize, String)> = entries
        .iter()
        .filter_map(|(key, value)| {
            let index = key
                .strip_prefix("SUBDATASET_")?
                .strip_suffix("_NAME")?
                .parse()
                .ok()?;
            Some((index, value.as_str()?.to_string()))
        })
        .collect();
    names.sort_by_key(|(index, _)| *index);
    names.into_iter().map(|(_, name)| name).collect()
}
