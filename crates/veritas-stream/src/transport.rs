use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Future, Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Url};
use tracing::{debug, instrument};

use veritas_core::{SessionFamily, SessionId, StreamError};

use crate::frame::{FrameSplitter, Framing};

/// Raw text frames of one subscription, in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// The external event endpoint. Opening yields the frame stream for one
/// session; dropping the stream releases the transport.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn open(&self, session_id: &SessionId) -> Result<FrameStream, StreamError>;
}

/// Backend base address. Endpoint paths are appended as percent-encoded
/// segments, so ids carried over from legacy documents stay one segment.
#[derive(Clone, Debug)]
pub struct BackendUrl(Url);

impl BackendUrl {
    pub fn parse(raw: &str) -> Result<Self, StreamError> {
        let url = Url::parse(raw).map_err(|e| StreamError::InvalidUrl(format!("{raw}: {e}")))?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(StreamError::InvalidUrl(format!("{raw}: not an http(s) base URL")));
        }
        Ok(Self(url))
    }

    pub fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.0.clone();
        url.set_query(None);
        url.set_fragment(None);
        // `parse` rejected cannot-be-a-base URLs, so segments are available.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

impl std::fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

pub(crate) fn build_client(connect_timeout: Duration) -> Result<Client, StreamError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| StreamError::Network(format!("failed to build HTTP client: {e}")))
}

/// Send `request` and wrap a successful response body in a [`FrameReader`].
pub(crate) async fn open_stream(
    request: RequestBuilder,
    idle_timeout: Duration,
) -> Result<FrameStream, StreamError> {
    let resp = request
        .header(reqwest::header::ACCEPT, "text/event-stream, application/x-ndjson")
        .send()
        .await
        .map_err(|e| StreamError::Network(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(StreamError::Status { status, body });
    }

    let framing = Framing::from_content_type(
        resp.headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    );
    debug!(url = %resp.url(), ?framing, "event stream opened");

    let bytes = resp
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| StreamError::Interrupted(e.to_string())));
    Ok(Box::pin(FrameReader::new(bytes, framing, idle_timeout)))
}

/// Event source over HTTP: `GET {base}/{family}/events/{session_id}`.
pub struct HttpEventSource {
    client: Client,
    base: BackendUrl,
    family: SessionFamily,
    idle_timeout: Duration,
}

impl HttpEventSource {
    pub fn new(
        base_url: &str,
        family: SessionFamily,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, StreamError> {
        Ok(Self {
            client: build_client(connect_timeout)?,
            base: BackendUrl::parse(base_url)?,
            family,
            idle_timeout,
        })
    }

    pub fn events_url(&self, session_id: &SessionId) -> Url {
        self.base
            .endpoint([self.family.route(), "events", session_id.as_str()])
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    #[instrument(skip(self), fields(family = %self.family))]
    async fn open(&self, session_id: &SessionId) -> Result<FrameStream, StreamError> {
        let url = self.events_url(session_id);
        open_stream(self.client.get(url), self.idle_timeout).await
    }
}

/// Turns a byte stream into frames, failing with
/// [`StreamError::IdleTimeout`] if no bytes arrive for `idle_duration`.
pub struct FrameReader {
    inner: ByteStream,
    splitter: FrameSplitter,
    pending: VecDeque<String>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl FrameReader {
    pub fn new(
        byte_stream: impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
        framing: Framing,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            splitter: FrameSplitter::new(framing),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }
}

impl Stream for FrameReader {
    type Item = Result<String, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    let frames = self.splitter.push(&bytes);
                    self.pending.extend(frames);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let frames = self.splitter.finish();
                    self.pending.extend(frames);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(StreamError::IdleTimeout(self.idle_duration))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer, family: SessionFamily) -> HttpEventSource {
        HttpEventSource::new(&server.uri(), family, Duration::from_secs(5), Duration::from_secs(5))
            .unwrap()
    }

    fn local(family: SessionFamily, base: &str) -> HttpEventSource {
        HttpEventSource::new(base, family, Duration::from_secs(1), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn events_url_uses_family_route() {
        let src = local(SessionFamily::Research, "http://127.0.0.1:8420/");
        assert_eq!(
            src.events_url(&SessionId::from_raw("s1")).as_str(),
            "http://127.0.0.1:8420/research/events/s1"
        );
        let prefixed = local(SessionFamily::Ask, "http://host/api?x=1");
        assert_eq!(
            prefixed.events_url(&SessionId::from_raw("s1")).as_str(),
            "http://host/api/ask/events/s1"
        );
    }

    #[test]
    fn legacy_ids_are_a_single_encoded_segment() {
        let src = local(SessionFamily::Ask, "http://127.0.0.1:8420");
        let url = src.events_url(&SessionId::from_raw("legacy id/#1?"));
        assert_eq!(url.as_str(), "http://127.0.0.1:8420/ask/events/legacy%20id%2F%231%3F");
        assert_eq!(url.fragment(), None);
        assert_eq!(url.query(), None);
        assert_eq!(url.path_segments().unwrap().count(), 3);
    }

    #[test]
    fn unusable_base_urls_are_rejected() {
        for raw in ["127.0.0.1:8420", "mailto:someone@example.org", "ftp://host", ""] {
            let err = BackendUrl::parse(raw).unwrap_err();
            assert_eq!(err.error_kind(), "invalid_url", "{raw}");
        }
    }

    #[tokio::test]
    async fn encoded_id_reaches_the_server_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ask/events/a%20b"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{\"type\":\"done\"}\n", "application/x-ndjson"))
            .mount(&server)
            .await;

        let stream = source(&server, SessionFamily::Ask)
            .open(&SessionId::from_raw("a b"))
            .await
            .unwrap();
        let frames: Vec<_> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(frames, vec![r#"{"type":"done"}"#]);
    }

    #[tokio::test]
    async fn sse_body_is_split_into_frames() {
        let server = MockServer::start().await;
        let body = "data: {\"type\":\"connected\",\"message\":\"hi\"}\n\n: comment\n\ndata: {\"type\":\"done\"}\n\n";
        Mock::given(method("GET"))
            .and(path("/ask/events/s1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let stream = source(&server, SessionFamily::Ask)
            .open(&SessionId::from_raw("s1"))
            .await
            .unwrap();
        let frames: Vec<_> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(
            frames,
            vec![r#"{"type":"connected","message":"hi"}"#, r#"{"type":"done"}"#]
        );
    }

    #[tokio::test]
    async fn ndjson_body_is_split_by_line() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/research/events/r1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    "{\"type\":\"status\"}\n{\"type\":\"done\"}\n",
                    "application/x-ndjson",
                ),
            )
            .mount(&server)
            .await;

        let stream = source(&server, SessionFamily::Research)
            .open(&SessionId::from_raw("r1"))
            .await
            .unwrap();
        let frames: Vec<_> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such session"))
            .mount(&server)
            .await;

        let err = source(&server, SessionFamily::Ask)
            .open(&SessionId::from_raw("gone"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Status { status: 404, ref body } if body == "no such session"));
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let bytes = futures::stream::pending::<Result<Bytes, StreamError>>();
        let mut reader = Box::pin(FrameReader::new(bytes, Framing::Sse, Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;

        let item = reader.next().await;
        assert!(
            matches!(&item, Some(Err(StreamError::IdleTimeout(d))) if *d == Duration::from_secs(5)),
            "expected idle timeout, got: {item:?}"
        );
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, StreamError>>(16);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut reader = Box::pin(FrameReader::new(rx_stream, Framing::Sse, Duration::from_secs(5)));

        tx.send(Ok(Bytes::from("data: {\"type\":\"ping\"}\n\n"))).await.unwrap();
        assert!(reader.next().await.unwrap().is_ok());

        tokio::time::advance(Duration::from_secs(4)).await;

        tx.send(Ok(Bytes::from("data: {\"type\":\"ping\"}\n\n"))).await.unwrap();
        assert!(reader.next().await.unwrap().is_ok());

        drop(tx);
        let item = reader.next().await;
        assert!(item.is_none(), "expected stream end, got: {item:?}");
    }

    #[tokio::test]
    async fn transport_error_ends_reader() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from("data: {\"type\":\"starting\"}\n\n")),
            Err(StreamError::Interrupted("reset by peer".into())),
            Ok(Bytes::from("data: {\"type\":\"done\"}\n\n")),
        ]);
        let reader = FrameReader::new(chunks, Framing::Sse, Duration::from_secs(5));
        let items: Vec<_> = reader.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(StreamError::Interrupted(_))));
    }
}
