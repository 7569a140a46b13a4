//! reqwest-backed [`Transport`].

use futures::StreamExt;
use futures::stream;
use reqwest::header::{ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, trace};

use crate::config::HttpConfig;
use crate::error::CacheError;
use crate::origin::OriginId;

use super::{ByteRangeRequest, ResponseInfo, Transport, TransportEvent, TransportStream};

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &HttpConfig) -> Result<Client, CacheError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5) // Allow multiple connections to same host
        .user_agent(&config.user_agent)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    // No overall timeout here: a ranged transfer of a long video may
    // legitimately run for minutes. Stalls are caught by the read timeout.
    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    client_builder.build().map_err(CacheError::from)
}

/// Parsed `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Inclusive first/last byte of the body, absent for `bytes */total`.
    pub range: Option<(u64, u64)>,
    /// Total resource length, absent for `bytes a-b/*`.
    pub total: Option<u64>,
}

/// Parse `bytes 0-99/1000`, `bytes 0-99/*` or `bytes */1000`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range_part, total_part) = rest.split_once('/')?;

    let total = match total_part.trim() {
        "*" => None,
        total => Some(total.parse::<u64>().ok()?),
    };

    let range = match range_part.trim() {
        "*" => None,
        range => {
            let (first, last) = range.split_once('-')?;
            let first = first.trim().parse::<u64>().ok()?;
            let last = last.trim().parse::<u64>().ok()?;
            if last < first {
                return None;
            }
            Some((first, last))
        }
    };

    Some(ContentRange { range, total })
}

fn response_info(response: &Response, requested: ByteRangeRequest) -> ResponseInfo {
    let headers = response.headers();
    let partial = response.status() == StatusCode::PARTIAL_CONTENT;

    let content_range = headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range);

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let advertises_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

    // A 200 reply to a ranged request is the whole body from byte 0.
    let start_offset = if partial {
        content_range
            .and_then(|cr| cr.range)
            .map_or(requested.start, |(first, _)| first)
    } else {
        0
    };

    ResponseInfo {
        content_range_total: content_range.and_then(|cr| cr.total),
        content_length: response.content_length(),
        content_type,
        accepts_ranges: partial || advertises_ranges,
        partial,
        start_offset,
    }
}

enum TransferState {
    Connect {
        client: Client,
        url: String,
        range: ByteRangeRequest,
    },
    Body {
        response: Response,
        offset: u64,
    },
    Done,
}

/// [`Transport`] issuing HTTP range requests.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self, CacheError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Transport for HttpTransport {
    fn open(&self, origin: &OriginId, range: ByteRangeRequest) -> TransportStream {
        let initial = TransferState::Connect {
            client: self.client.clone(),
            url: origin.as_str().to_owned(),
            range,
        };

        stream::unfold(initial, |state| async move {
            match state {
                TransferState::Connect { client, url, range } => {
                    debug!(url = %url, range = %range.header_value(), "Opening upstream transfer");
                    let response = match client
                        .get(&url)
                        .header(RANGE, range.header_value())
                        // Offsets must refer to the stored bytes, not a compressed encoding.
                        .header(ACCEPT_ENCODING, "identity")
                        .send()
                        .await
                    {
                        Ok(response) => response,
                        Err(e) => {
                            return Some((TransportEvent::Failed(e.into()), TransferState::Done));
                        }
                    };

                    let status = response.status();
                    if status == StatusCode::RANGE_NOT_SATISFIABLE {
                        let length = range.end.map_or(0, |end| end.saturating_sub(range.start));
                        return Some((
                            TransportEvent::Failed(CacheError::InvalidRange {
                                offset: range.start,
                                length,
                            }),
                            TransferState::Done,
                        ));
                    }
                    if !status.is_success() {
                        return Some((
                            TransportEvent::Failed(CacheError::Upstream(format!(
                                "Server returned status code {status} for {url}"
                            ))),
                            TransferState::Done,
                        ));
                    }

                    let info = response_info(&response, range);
                    let offset = info.start_offset;
                    Some((
                        TransportEvent::Headers(info),
                        TransferState::Body { response, offset },
                    ))
                }
                TransferState::Body {
                    mut response,
                    offset,
                } => match response.chunk().await {
                    Ok(Some(data)) => {
                        trace!(offset, len = data.len(), "Received chunk");
                        let next = offset + data.len() as u64;
                        Some((
                            TransportEvent::Chunk { offset, data },
                            TransferState::Body {
                                response,
                                offset: next,
                            },
                        ))
                    }
                    Ok(None) => Some((TransportEvent::Completed, TransferState::Done)),
                    Err(e) => Some((TransportEvent::Failed(e.into()), TransferState::Done)),
                },
                TransferState::Done => None,
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-99/1000"),
            Some(ContentRange {
                range: Some((0, 99)),
                total: Some(1000)
            })
        );
    }

    #[test]
    fn parses_unknown_total() {
        assert_eq!(
            parse_content_range("bytes 200-299/*"),
            Some(ContentRange {
                range: Some((200, 299)),
                total: None
            })
        );
    }

    #[test]
    fn parses_unsatisfied_range() {
        assert_eq!(
            parse_content_range("bytes */5000"),
            Some(ContentRange {
                range: None,
                total: Some(5000)
            })
        );
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes 10-5/20"), None);
        assert_eq!(parse_content_range("bytes 0-x/20"), None);
        assert_eq!(parse_content_range("bytes 0-10"), None);
    }

    #[test]
    fn builds_client_from_defaults() {
        assert!(HttpTransport::new(&HttpConfig::default()).is_ok());
    }
}
