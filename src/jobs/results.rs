use serde::{Deserialize, Serialize};

/// Media attachment of a feed item: either a bare URL or an attribute object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Enclosure {
    Url(String),
    Object {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<String>,
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl Enclosure {
    pub fn url(&self) -> &str {
        match self {
            Enclosure::Url(url) => url,
            Enclosure::Object { url, .. } => url,
        }
    }
}

/// One feed item as extracted by a crawl
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawledEpisode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure: Option<Enclosure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl CrawledEpisode {
    /// Dedupe identifier: GUID if present, else link
    pub fn identifier(&self) -> Option<&str> {
        non_empty(self.guid.as_deref()).or_else(|| non_empty(self.link.as_deref()))
    }

    pub fn audio_url(&self) -> &str {
        self.enclosure.as_ref().map(Enclosure::url).unwrap_or("")
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResult {
    pub episodes: Vec<CrawledEpisode>,
    /// Elapsed milliseconds
    pub spent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub size: u64,
    pub output_path: String,
    pub spent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordReserveResult {
    pub record_job_id: String,
    pub spent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub output_path: String,
    pub size: u64,
    /// Seconds actually recorded
    pub duration: u64,
    pub spent: u64,
}

/// Result of a finished job, resolved from an update message by its job type
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Crawl(CrawlResult),
    Download(DownloadResult),
    RecordReserve(RecordReserveResult),
    Record(RecordResult),
}
