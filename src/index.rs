//! Published listings: the per-granule `index.html` and the per-date scene list.
use crate::error::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const INDEX_FILENAME: &str = "index.html";

/// One row of the scene list. Fields are declared in the column order of the
/// header, which is alphabetical.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SceneRecord {
    pub corrected_date: NaiveDate,
    pub granule_id: String,
    pub index_url: String,
}

/// HTML listing of a granule's published files. `files` are sorted so the page
/// only depends on the set of files.
pub fn render_index(thumbnail: &str, product: &str, files: &[String]) -> String {
    let mut files = files.to_vec();
    files.sort();

    let items: String = files
        .iter()
        .map(|file| {
            let file = escape(file);
            format!("<li><a href=\"{file}\">{file}</a></li>\n")
        })
        .collect();
    let product = escape(product);
    let thumbnail = escape(thumbnail);

    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>{product}</title></head>\n\
         <body>\n\
         <h1>{product}</h1>\n\
         <img src=\"{thumbnail}\" alt=\"thumbnail\"/>\n\
         <ul>\n\
         {items}\
         </ul>\n\
         </body>\n\
         </html>\n"
    )
}

/// Write `index.html` into `dir`, listing `files` by filename.
pub async fn write_index(dir: &Path, thumbnail: &Path, product: &str, files: &[PathBuf]) -> Result<PathBuf> {
    let names: Vec<String> = files.iter().map(|f| file_name(f)).collect();
    let html = render_index(&file_name(thumbnail), product, &names);
    let path = dir.join(INDEX_FILENAME);
    fs::write(&path, html).await?;
    Ok(path)
}

/// Header row plus one comma separated row per record.
pub fn render_scene_list(records: &[SceneRecord]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::<u8>::new());
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn write_scene_list(path: &Path, records: &[SceneRecord]) -> Result<PathBuf> {
    fs::write(path, render_scene_list(records)?).await?;
    Ok(path.to_path_buf())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(gid: &str) -> SceneRecord {
        SceneRecord {
            corrected_date: NaiveDate::from_ymd_opt(2016, 1, 1).unwrap(),
            granule_id: gid.to_string(),
            index_url: format!("https://modis-pds.s3.amazonaws.com/MCD43A4.006/{gid}/index.html"),
        }
    }

    #[test]
    fn test_index_is_sorted() {
        let a = render_index(
            "thumb.jpg",
            "product.hdf",
            &["file2.tif".to_string(), "file1.tif".to_string()],
        );
        let b = render_index(
            "thumb.jpg",
            "product.hdf",
            &["file1.tif".to_string(), "file2.tif".to_string()],
        );
        assert_eq!(a, b);
        assert!(a.find("file1.tif").unwrap() < a.find("file2.tif").unwrap());
        assert!(a.contains("<img src=\"thumb.jpg\""));
    }

    #[test]
    fn test_index_layout() {
        let html = render_index("t.jpg", "p.hdf", &["a.TIF".to_string()]);
        let lines: Vec<&str> = html.lines().collect();
        assert_eq!(
            lines,
            vec![
                "<!DOCTYPE html>",
                "<html>",
                "<head><title>p.hdf</title></head>",
                "<body>",
                "<h1>p.hdf</h1>",
                "<img src=\"t.jpg\" alt=\"thumbnail\"/>",
                "<ul>",
                "<li><a href=\"a.TIF\">a.TIF</a></li>",
                "</ul>",
                "</body>",
                "</html>",
            ]
        );
    }

    #[test]
    fn test_index_escapes() {
        let html = render_index("t.jpg", "a<b>", &[]);
        assert!(html.contains("a&lt;b&gt;"));
    }

    #[tokio::test]
    async fn test_write_index_uses_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![dir.path().join("x_B02.TIF"), dir.path().join("x_B01.TIF")];
        let path = write_index(dir.path(), &dir.path().join("BROWSE.x.jpg"), "x.hdf", &files)
            .await
            .unwrap();

        assert_eq!(path, dir.path().join(INDEX_FILENAME));
        let html = std::fs::read_to_string(path).unwrap();
        assert!(html.contains("href=\"x_B01.TIF\""));
        assert!(!html.contains(&dir.path().display().to_string()));
    }

    #[test]
    fn test_scene_list_shape() {
        let records = vec![record("a"), record("b"), record("c")];
        let text = render_scene_list(&records).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "corrected_date,granule_id,index_url");
        assert_eq!(
            lines[1],
            "2016-01-01,a,https://modis-pds.s3.amazonaws.com/MCD43A4.006/a/index.html"
        );
        for line in &lines {
            assert_eq!(line.split(',').count(), 3);
        }
    }
}
