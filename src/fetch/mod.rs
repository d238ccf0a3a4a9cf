//! Outbound fetching: HTTP transport and feed parsing

pub mod feed;
pub mod http;

pub use feed::{FeedDocument, FeedError, FeedParser, XmlFeedParser, XmlNode, extract_episodes};
pub use http::{FetchError, HttpConfig, HttpFetcher, ReqwestFetcher};
