//! Feed documents and episode extraction

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use thiserror::Error;
use tracing::warn;

use crate::jobs::{CrawledEpisode, Enclosure};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("XML error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("Document has no root element")]
    Empty,

    #[error("Document ended inside <{0}>")]
    Unterminated(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// One XML element with its attributes, text and children
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    /// Qualified name, e.g. `itunes:item`
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed text of a child, `None` when absent or blank
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

/// A parsed feed document
#[derive(Debug, Clone, PartialEq)]
pub struct FeedDocument {
    pub root: XmlNode,
}

/// Turns raw feed bytes into a document tree
pub trait FeedParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<FeedDocument>;
}

/// quick-xml based parser
#[derive(Debug, Clone, Default)]
pub struct XmlFeedParser;

impl XmlFeedParser {
    fn element(start: &BytesStart<'_>, position: u64) -> Result<XmlNode> {
        let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| FeedError::Xml {
                position,
                message: e.to_string(),
            })?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| FeedError::Xml {
                    position,
                    message: e.to_string(),
                })?
                .to_string();
            attributes.push((key, value));
        }

        Ok(XmlNode {
            name,
            attributes,
            ..XmlNode::default()
        })
    }
}

impl FeedParser for XmlFeedParser {
    fn parse(&self, bytes: &[u8]) -> Result<FeedDocument> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;
        let mut buf = Vec::new();

        loop {
            let position = reader.buffer_position() as u64;
            let event = reader.read_event_into(&mut buf).map_err(|e| FeedError::Xml {
                position,
                message: e.to_string(),
            })?;

            match event {
                Event::Start(start) => stack.push(Self::element(&start, position)?),
                Event::Empty(start) => {
                    let node = Self::element(&start, position)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root = root.or(Some(node)),
                    }
                }
                Event::End(_) => {
                    if let Some(node) = stack.pop() {
                        match stack.last_mut() {
                            Some(parent) => parent.children.push(node),
                            None => root = root.or(Some(node)),
                        }
                    }
                }
                Event::Text(text) => {
                    if let Some(node) = stack.last_mut() {
                        let text = text.unescape().map_err(|e| FeedError::Xml {
                            position,
                            message: e.to_string(),
                        })?;
                        node.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if let Some(open) = stack.pop() {
            return Err(FeedError::Unterminated(open.name));
        }

        root.map(|root| FeedDocument { root })
            .ok_or(FeedError::Empty)
    }
}

/// Extract episode records from an RSS document
///
/// Handles `rss/channel/item` and podcast `rss/channel/itunes:item`, one or
/// many. Any other shape yields an empty list and a warning.
pub fn extract_episodes(document: &FeedDocument) -> Vec<CrawledEpisode> {
    let root = &document.root;
    let Some(channel) = (root.name == "rss").then(|| root.child("channel")).flatten() else {
        warn!(root = %root.name, "Unknown feed format");
        return Vec::new();
    };

    let items: Vec<&XmlNode> = {
        let plain: Vec<&XmlNode> = channel.children_named("item").collect();
        if plain.is_empty() {
            channel.children_named("itunes:item").collect()
        } else {
            plain
        }
    };

    if items.is_empty() {
        warn!("Feed channel has no items");
    }

    items.into_iter().map(episode_from_item).collect()
}

fn episode_from_item(item: &XmlNode) -> CrawledEpisode {
    CrawledEpisode {
        title: item
            .child_text("title")
            .or_else(|| item.child_text("itunes:title")),
        link: item.child_text("link"),
        description: item
            .child_text("description")
            .or_else(|| item.child_text("itunes:summary")),
        pub_date: item.child_text("pubDate"),
        enclosure: item.child("enclosure").and_then(enclosure_from),
        guid: item.child_text("guid"),
        duration: item.child_text("itunes:duration"),
    }
}

fn enclosure_from(node: &XmlNode) -> Option<Enclosure> {
    if let Some(url) = node.attr("url") {
        return Some(Enclosure::Object {
            url: url.to_string(),
            length: node.attr("length").map(str::to_string),
            mime_type: node.attr("type").map(str::to_string),
        });
    }

    let text = node.text.trim();
    (!text.is_empty()).then(|| Enclosure::Url(text.to_string()))
}
