use async_trait::async_trait;
use once_cell::sync::Lazy;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use reqwest::header::USER_AGENT;
use tracing::{debug, trace};
use url::Url;

use crate::bencode::{self, Value};
use crate::codec::HASH_LEN;
use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::tracker::{
    AnnounceRequest, AnnounceResponse, ScrapeEntry, TrackerProtocol, parse_compact_peers,
};

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| Client::builder().build().unwrap_or_default());

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Appends `params` to whatever query `base` already carries.
fn with_query(base: &Url, params: &str) -> Url {
    let mut url = base.clone();
    let query = match base.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{params}"),
        _ => params.to_string(),
    };
    url.set_query(Some(&query));
    url
}

pub(crate) fn build_announce_url(base: &Url, request: &AnnounceRequest) -> Url {
    let mut params = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        encode_bytes(&request.info_hash),
        encode_bytes(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left
    );
    if request.num_want >= 0 {
        params.push_str(&format!("&numwant={}", request.num_want));
    }
    let event = request.event.as_str();
    if !event.is_empty() {
        params.push_str(&format!("&event={event}"));
    }
    with_query(base, &params)
}

/// Scrape URL derived from an announce URL whose last path segment starts
/// with "announce".
pub(crate) fn build_scrape_url(base: &Url, info_hashes: &[[u8; HASH_LEN]]) -> Result<Url> {
    let path = base.path();
    let (dir, last) = path.rsplit_once('/').unwrap_or(("", path));
    let Some(suffix) = last.strip_prefix("announce") else {
        return Err(Error::invalid_state(format!("{base} does not support scrape")));
    };

    let mut url = base.clone();
    url.set_path(&format!("{dir}/scrape{suffix}"));
    let params = info_hashes
        .iter()
        .map(|hash| format!("info_hash={}", encode_bytes(hash)))
        .collect::<Vec<_>>()
        .join("&");
    Ok(with_query(&url, &params))
}

fn failure_reason(root: &Value) -> Option<Error> {
    let reason = root.get(b"failure reason")?;
    let text = String::from_utf8_lossy(reason.as_bytes().unwrap_or_default());
    Some(Error::Tracker(text.into_owned()))
}

fn count(dict: &Value, key: &[u8]) -> u32 {
    dict.get(key)
        .and_then(Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

fn parse_peer_list(value: &Value) -> Result<Vec<std::net::SocketAddr>> {
    if let Some(compact) = value.as_bytes() {
        return parse_compact_peers(compact)
            .ok_or_else(|| Error::Tracker("compact peers are not 6-byte entries".into()));
    }
    let entries = value
        .as_list()
        .ok_or_else(|| Error::Tracker("peers is neither a string nor a list".into()))?;

    // dictionary model: {ip, port} per peer; unresolvable hostnames are skipped
    Ok(entries
        .iter()
        .filter_map(|entry| {
            let ip = entry.get(b"ip")?.as_str()?.parse().ok()?;
            let port = u16::try_from(entry.get(b"port")?.as_integer()?).ok()?;
            Some(std::net::SocketAddr::new(ip, port))
        })
        .collect())
}

pub(crate) fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let root = bencode::decode(body)?;
    if let Some(failure) = failure_reason(&root) {
        return Err(failure);
    }
    let interval = root
        .get(b"interval")
        .and_then(Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| Error::Tracker("response has no interval".into()))?;
    let peers = match root.get(b"peers") {
        Some(peers) => parse_peer_list(peers)?,
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        leechers: count(&root, b"incomplete"),
        seeders: count(&root, b"complete"),
        peers,
    })
}

pub(crate) fn parse_scrape_response(
    body: &[u8],
    info_hashes: &[[u8; HASH_LEN]],
) -> Result<Vec<ScrapeEntry>> {
    let root = bencode::decode(body)?;
    if let Some(failure) = failure_reason(&root) {
        return Err(failure);
    }
    let files = root
        .get(b"files")
        .ok_or_else(|| Error::Tracker("scrape response has no files".into()))?;

    Ok(info_hashes
        .iter()
        .map(|hash| {
            files
                .get(hash)
                .map(|file| ScrapeEntry {
                    seeders: count(file, b"complete"),
                    completed: count(file, b"downloaded"),
                    leechers: count(file, b"incomplete"),
                })
                .unwrap_or_default()
        })
        .collect())
}

/// Announces with HTTP GET requests and compact peer lists.
pub struct HttpTracker {
    url: Url,
    config: TrackerConfig,
}

impl HttpTracker {
    pub fn new(url: Url, config: TrackerConfig) -> Self {
        Self { url, config }
    }

    async fn get(&self, url: Url) -> Result<Vec<u8>> {
        trace!(%url, "http tracker request");
        let response = HTTP_CLIENT
            .get(url)
            .header(USER_AGENT, self.config.user_agent)
            .timeout(self.config.http_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Tracker(format!("http status {}", response.status())));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl TrackerProtocol for HttpTracker {
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_announce(&mut self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let body = self.get(build_announce_url(&self.url, request)).await?;
        let response = parse_announce_response(&body)?;
        debug!(url = %self.url, peers = response.peers.len(), "http announce parsed");
        Ok(response)
    }

    async fn on_stop(&mut self) {}

    async fn scrape(&mut self, info_hashes: &[[u8; HASH_LEN]]) -> Result<Vec<ScrapeEntry>> {
        if info_hashes.is_empty() {
            return Err(Error::invalid_argument("scrape needs at least one info hash"));
        }
        let body = self.get(build_scrape_url(&self.url, info_hashes)?).await?;
        parse_scrape_response(&body, info_hashes)
    }
}
