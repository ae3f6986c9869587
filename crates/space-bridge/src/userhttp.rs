//! Request multiplexer.
//!
//! The guest submits a request under an id of its choosing and returns
//! immediately. The exchange runs as a task on the host runtime; when it
//! finishes (or its timeout fires first) the serialized [`ResultEnvelope`]
//! is stored as ready and a [`Completion`] is sent to the driver, which
//! forwards it to the guest's `userhttp_ready(id, len)` export. The guest
//! then asks for the size and pops the envelope into a buffer of exactly
//! that size.
//!
//! Per id: `Pending -> Ready -> removed`.

use crate::{
    memory::GuestMemory,
    network::{NativeRequest, Network},
    schema::{RequestDescriptor, ResultEnvelope},
    Error, Result,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{runtime::Handle, sync::mpsc};

/// Sent once per accepted request, after its envelope is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: u32,
    pub len: u32,
}

pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

enum Entry {
    Pending,
    Ready(String),
}

type Table = Arc<Mutex<HashMap<u32, Entry>>>;

fn lock(table: &Table) -> MutexGuard<'_, HashMap<u32, Entry>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct UserHttp {
    network: Arc<dyn Network>,
    runtime: Handle,
    requests: Table,
    ready: mpsc::UnboundedSender<Completion>,
}

impl UserHttp {
    pub fn new(network: Arc<dyn Network>, runtime: Handle) -> (Self, CompletionReceiver) {
        let (ready, rx) = mpsc::unbounded_channel();
        let this = Self {
            network,
            runtime,
            requests: Table::default(),
            ready,
        };
        (this, rx)
    }

    /// Register `id` as pending. Fails if the id is still in the table.
    fn register(&self, id: u32) -> Result<()> {
        let mut table = lock(&self.requests);
        if table.contains_key(&id) {
            return Err(Error::DuplicateRequest(id));
        }
        table.insert(id, Entry::Pending);
        Ok(())
    }

    /// Submit a JSON request descriptor.
    ///
    /// A descriptor that cannot be turned into a request still completes,
    /// with an error envelope.
    pub fn submit(&self, id: u32, descriptor: &str) -> Result<()> {
        self.register(id)?;

        let request = RequestDescriptor::parse(descriptor)
            .and_then(|desc| Ok((desc.to_native()?, desc.timeout())));
        match request {
            Ok((request, timeout)) => self.spawn(id, request, timeout),
            Err(error) => {
                tracing::error!("request {}: invalid descriptor: {}", id, error);
                complete(
                    &self.requests,
                    &self.ready,
                    id,
                    ResultEnvelope::error(format!("invalid request: {error}")),
                );
            }
        }
        Ok(())
    }

    /// Register `id` and complete it at once with an error envelope.
    ///
    /// Used when the descriptor could not even be read from guest memory.
    pub fn fail(&self, id: u32, error: impl std::fmt::Display) -> Result<()> {
        self.register(id)?;
        complete(&self.requests, &self.ready, id, ResultEnvelope::error(error));
        Ok(())
    }

    fn spawn(&self, id: u32, request: NativeRequest, timeout: Option<Duration>) {
        let network = self.network.clone();
        let requests = self.requests.clone();
        let ready = self.ready.clone();
        self.runtime.spawn(async move {
            let envelope = perform(network.as_ref(), request, timeout).await;
            complete(&requests, &ready, id, envelope);
        });
    }

    /// Envelope length of a ready request, `0` if unknown or still pending.
    pub fn size(&self, id: u32) -> u32 {
        match lock(&self.requests).get(&id) {
            Some(Entry::Ready(json)) => envelope_len(json),
            _ => 0,
        }
    }

    /// Take the envelope of a ready request out of the table.
    ///
    /// A pending entry is left in place.
    pub fn take(&self, id: u32) -> Result<String> {
        let mut table = lock(&self.requests);
        match table.remove(&id) {
            Some(Entry::Ready(json)) => Ok(json),
            Some(pending @ Entry::Pending) => {
                table.insert(id, pending);
                Err(Error::RequestPending(id))
            }
            None => Err(Error::RequestNotFound(id)),
        }
    }

    /// Pop the envelope into the guest buffer `(ptr, len)`.
    ///
    /// The entry is consumed even when `len` differs from the reported
    /// size; in that case nothing is written.
    pub fn pop(&self, memory: &mut dyn GuestMemory, id: u32, ptr: u32, len: u32) -> Result<()> {
        let json = self.take(id)?;
        let expected = envelope_len(&json);
        if expected != len {
            return Err(Error::LengthMismatch {
                id,
                expected,
                got: len,
            });
        }
        memory.store_string(ptr, &json)
    }

    /// Requests whose exchange has not finished yet.
    pub fn in_flight(&self) -> usize {
        lock(&self.requests)
            .values()
            .filter(|entry| matches!(entry, Entry::Pending))
            .count()
    }
}

fn envelope_len(json: &str) -> u32 {
    u32::try_from(json.len()).unwrap_or(u32::MAX)
}

async fn perform(
    network: &dyn Network,
    request: NativeRequest,
    timeout: Option<Duration>,
) -> ResultEnvelope {
    let fetch = network.fetch(request);
    let result = match timeout {
        // dropping `fetch` aborts the exchange
        Some(timeout) => match tokio::time::timeout(timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
        },
        None => fetch.await,
    };
    match result {
        Ok(resp) => ResultEnvelope::Response {
            status: resp.status,
            header_params: resp.headers,
            content_base64: resp.body,
        },
        Err(error) => ResultEnvelope::error(error),
    }
}

fn complete(
    requests: &Table,
    ready: &mpsc::UnboundedSender<Completion>,
    id: u32,
    envelope: ResultEnvelope,
) {
    let json = envelope.to_json().unwrap_or_else(|error| {
        serde_json::json!({ "error": error.to_string() }).to_string()
    });
    let len = envelope_len(&json);
    // the completion is queued before the entry stops counting as in flight
    let mut table = lock(requests);
    table.insert(id, Entry::Ready(json));
    tracing::debug!("request {} ready, {} bytes", id, len);
    if ready.send(Completion { id, len }).is_err() {
        tracing::warn!("request {} ready but no driver is listening", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::LinearMemory, network::NativeResponse};
    use async_trait::async_trait;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Canned {
        seen: Mutex<Vec<NativeRequest>>,
    }

    #[async_trait]
    impl Network for Canned {
        async fn fetch(&self, request: NativeRequest) -> Result<NativeResponse> {
            self.seen.lock().unwrap().push(request);
            Ok(NativeResponse {
                status: 200,
                headers: vec![("content-type".into(), "text/plain".into())],
                body: b"ok".to_vec(),
            })
        }
    }

    struct Never;

    #[async_trait]
    impl Network for Never {
        async fn fetch(&self, _: NativeRequest) -> Result<NativeResponse> {
            std::future::pending().await
        }
    }

    struct Refused;

    #[async_trait]
    impl Network for Refused {
        async fn fetch(&self, _: NativeRequest) -> Result<NativeResponse> {
            Err(Error::custom(anyhow::anyhow!("connection refused")))
        }
    }

    /// Answers after the number of milliseconds given as the URL path.
    struct Delayed;

    #[async_trait]
    impl Network for Delayed {
        async fn fetch(&self, request: NativeRequest) -> Result<NativeResponse> {
            let ms = request.url.path().trim_start_matches('/').parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(NativeResponse {
                status: 200,
                headers: Vec::new(),
                body: request.url.path().as_bytes().to_vec(),
            })
        }
    }

    fn userhttp(network: impl Network + 'static) -> (UserHttp, CompletionReceiver) {
        UserHttp::new(Arc::new(network), Handle::current())
    }

    fn pop_envelope(http: &UserHttp, c: Completion) -> ResultEnvelope {
        let mut memory = LinearMemory::new(c.len as usize + 8);
        http.pop(&mut memory, c.id, 8, c.len).unwrap();
        let json = std::str::from_utf8(memory.slice(8, c.len).unwrap()).unwrap();
        ResultEnvelope::parse(json).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        tracing_subscriber::fmt::try_init().ok();
        let network = Arc::new(Canned::default());
        let (http, mut rx) = UserHttp::new(network.clone(), Handle::current());

        http.submit(
            7,
            r#"{"url":"https://e.x/api","method":"GET","query_params":[["q","1"]]}"#,
        )
        .unwrap();

        let c = rx.recv().await.unwrap();
        assert_eq!(c.id, 7);
        assert_eq!(http.size(7), c.len);
        assert_eq!(http.in_flight(), 0);

        match pop_envelope(&http, c) {
            ResultEnvelope::Response {
                status,
                content_base64,
                ..
            } => {
                assert_eq!(status, 200);
                assert_eq!(content_base64, b"ok");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
        assert_eq!(
            network.seen.lock().unwrap()[0].url.as_str(),
            "https://e.x/api?q=1"
        );

        // retrieved exactly once
        assert_eq!(http.size(7), 0);
        assert!(matches!(http.take(7), Err(Error::RequestNotFound(7))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_is_not_ready() {
        let (http, _rx) = userhttp(Never);
        http.submit(1, r#"{"url":"https://e.x"}"#).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(http.size(1), 0);
        assert_eq!(http.in_flight(), 1);
        let mut memory = LinearMemory::new(16);
        assert!(matches!(
            http.pop(&mut memory, 1, 0, 16),
            Err(Error::RequestPending(1))
        ));
        assert_eq!(http.in_flight(), 1);
        assert_eq!(http.size(99), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_complete_independently() {
        let (http, mut rx) = userhttp(Delayed);
        http.submit(1, r#"{"url":"https://e.x/300"}"#).unwrap();
        http.submit(2, r#"{"url":"https://e.x/100"}"#).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(http.in_flight(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, 2);
        assert_eq!(http.size(1), 0);
        assert_eq!(http.in_flight(), 1);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.id, 1);
        assert_eq!(http.in_flight(), 0);

        // each id keeps its own result
        for (c, path) in [(second, "/300"), (first, "/100")] {
            match pop_envelope(&http, c) {
                ResultEnvelope::Response { content_base64, .. } => {
                    assert_eq!(content_base64, path.as_bytes())
                }
                other => panic!("unexpected envelope {other:?}"),
            }
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (http, mut rx) = userhttp(Never);
        let start = Instant::now();
        http.submit(3, r#"{"url":"https://e.x","timeout_ms":500}"#)
            .unwrap();

        let c = rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");

        match pop_envelope(&http, c) {
            ResultEnvelope::Error { error } => assert!(error.contains("timeout"), "{error}"),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_disarmed_on_response() {
        let (http, mut rx) = userhttp(Canned::default());
        http.submit(4, r#"{"url":"https://e.x","timeout_ms":10000}"#)
            .unwrap();
        let c = rx.recv().await.unwrap();
        assert!(!pop_envelope(&http, c).is_error());
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let (http, mut rx) = userhttp(Refused);
        http.submit(5, r#"{"url":"https://e.x"}"#).unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(
            pop_envelope(&http, c),
            ResultEnvelope::error("connection refused")
        );
    }

    #[tokio::test]
    async fn test_invalid_descriptor_completes_with_error() {
        let (http, mut rx) = userhttp(Canned::default());
        for (id, desc) in [
            (10, "not json"),
            (11, r#"{"url":"relative/path"}"#),
            (12, r#"{"url":"https://e.x","method":"BAD METHOD"}"#),
        ] {
            http.submit(id, desc).unwrap();
            let c = rx.recv().await.unwrap();
            assert_eq!(c.id, id);
            match pop_envelope(&http, c) {
                ResultEnvelope::Error { error } => assert!(error.starts_with("invalid request")),
                other => panic!("unexpected envelope {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (http, mut rx) = userhttp(Canned::default());
        http.submit(1, r#"{"url":"https://e.x"}"#).unwrap();
        assert!(matches!(
            http.submit(1, r#"{"url":"https://e.x"}"#),
            Err(Error::DuplicateRequest(1))
        ));

        let c = rx.recv().await.unwrap();
        // still unretrieved
        assert!(http.fail(1, "x").is_err());
        pop_envelope(&http, c);

        // free again after retrieval
        http.submit(1, r#"{"url":"https://e.x"}"#).unwrap();
        assert_eq!(rx.recv().await.unwrap().id, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_length_mismatch_consumes_entry() {
        let (http, mut rx) = userhttp(Canned::default());
        http.submit(2, r#"{"url":"https://e.x"}"#).unwrap();
        let c = rx.recv().await.unwrap();

        let mut memory = LinearMemory::new(c.len as usize + 1);
        assert!(matches!(
            http.pop(&mut memory, 2, 0, c.len + 1),
            Err(Error::LengthMismatch { id: 2, .. })
        ));
        assert!(memory.as_bytes().iter().all(|b| *b == 0));
        assert_eq!(http.size(2), 0);
    }

    #[tokio::test]
    async fn test_fail() {
        let (http, mut rx) = userhttp(Never);
        http.fail(8, "guest range out of bounds").unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(http.size(8), c.len);
        assert_eq!(
            pop_envelope(&http, c),
            ResultEnvelope::error("guest range out of bounds")
        );
    }
}
