use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Class id to label lookup.
///
/// Accepts either `"<id> <name>"` lines (TFLite / COCO style) or one name per
/// line, in which case the line number is the class id.
#[derive(Clone, Debug, Default)]
pub struct LabelMap {
    labels: HashMap<usize, String>,
}

impl LabelMap {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read label file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut labels = HashMap::new();
        let lines = raw.lines().map(str::trim).filter(|line| !line.is_empty());
        for (index, line) in lines.enumerate() {
            let mut parts = line.splitn(2, char::is_whitespace);
            let first = parts.next().unwrap_or_default();
            match (first.parse::<usize>(), parts.next()) {
                (Ok(id), Some(name)) if !name.trim().is_empty() => {
                    labels.insert(id, name.trim().to_string());
                }
                (Ok(_), _) => {
                    return Err(anyhow!("label line {} has an id but no name", index + 1));
                }
                (Err(_), _) => {
                    labels.insert(index, line.to_string());
                }
            }
        }
        Ok(Self { labels })
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: names
                .into_iter()
                .enumerate()
                .map(|(id, name)| (id, name.into()))
                .collect(),
        }
    }

    /// Label for a class id, `"?"` when unknown.
    pub fn lookup(&self, class_id: usize) -> String {
        self.labels
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| "?".to_string())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
