use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::OutputFormat;
use crate::scrape::item::ScrapedItem;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize results: {0}")]
    Json(#[from] serde_json::Error),
}

/// Renders items as CSV. Columns are the union of keys in first-seen order;
/// missing fields are empty.
pub fn to_csv(items: &[ScrapedItem]) -> String {
    if items.is_empty() {
        return String::new();
    }

    let mut columns: Vec<&str> = Vec::new();
    for item in items {
        for key in item.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut lines = Vec::with_capacity(items.len() + 1);
    lines.push(
        columns
            .iter()
            .map(|c| escape_field(c))
            .collect::<Vec<_>>()
            .join(","),
    );

    for item in items {
        let row = columns
            .iter()
            .map(|c| item.get(c).map(csv_value).unwrap_or_default())
            .map(|v| escape_field(&v))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(row);
    }

    lines.join("\n")
}

fn csv_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_field(raw: &str) -> String {
    if raw.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Pretty-printed JSON array. Absent fields are simply missing.
pub fn to_json(items: &[ScrapedItem]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(items)
}

pub fn render(items: &[ScrapedItem], format: OutputFormat) -> Result<String, ExportError> {
    Ok(match format {
        OutputFormat::Csv => to_csv(items),
        OutputFormat::Json => to_json(items)?,
    })
}

/// Writes `{id}.csv` and `{id}.json` under one directory.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    data_dir: PathBuf,
}

impl ResultWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, job_id: Uuid, format: OutputFormat) -> PathBuf {
        self.data_dir
            .join(format!("{job_id}.{}", format.extension()))
    }

    /// Writes both formats and returns the path of the requested one.
    pub async fn write_both(
        &self,
        job_id: Uuid,
        items: &[ScrapedItem],
        requested: OutputFormat,
    ) -> Result<PathBuf, ExportError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|source| ExportError::Io {
                path: self.data_dir.clone(),
                source,
            })?;

        let primary = self.write_one(job_id, items, requested).await?;
        self.write_one(job_id, items, requested.other()).await?;
        Ok(primary)
    }

    async fn write_one(
        &self,
        job_id: Uuid,
        items: &[ScrapedItem],
        format: OutputFormat,
    ) -> Result<PathBuf, ExportError> {
        let path = self.path_for(job_id, format);
        let body = render(items, format)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| ExportError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}
