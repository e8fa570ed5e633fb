#![allow(dead_code)]

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, Method, Request, StatusCode},
};
use quire::{
    application::{
        articles::ArticleService,
        repos::{MemoryRepository, RepoError, Repository},
    },
    cache::{CacheBackend, CacheConfig, CacheState, MemoryStore},
    config::DEFAULT_BUS_TOPIC,
    domain::articles::{Article, ArticleDraft},
    infra::http::{HttpState, build_router},
    invalidation::{
        BusConnection, BusConnector, BusError, BusTransport, InvalidationConsumer,
        InvalidationPublisher, MemoryBroker, MessageSource, SignalBus, register_signal_hooks,
    },
};
use tower::ServiceExt;

/// Article repository that counts reads, so tests can tell a cache hit from
/// a re-render.
pub struct CountingRepo {
    inner: MemoryRepository<Article>,
    reads: AtomicUsize,
}

impl CountingRepo {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository<Article> for CountingRepo {
    async fn get(&self, pk: &str) -> Result<Option<Article>, RepoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get(pk).await
    }

    async fn list(&self) -> Result<Vec<Article>, RepoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list().await
    }

    async fn save(&self, instance: Article) -> Result<Article, RepoError> {
        self.inner.save(instance).await
    }

    async fn delete(&self, pk: &str) -> Result<Article, RepoError> {
        self.inner.delete(pk).await
    }
}

/// A broker that never answers: every connect hangs until timed out.
#[derive(Default)]
pub struct SilentBroker {
    attempts: AtomicUsize,
}

impl SilentBroker {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusConnector for SilentBroker {
    fn describe(&self) -> String {
        "silent".to_string()
    }

    async fn open(&self) -> Result<Arc<dyn BusTransport>, BusError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn subscribe(&self, _destination: &str) -> Result<Box<dyn MessageSource>, BusError> {
        std::future::pending().await
    }
}

#[derive(Default)]
pub struct Options {
    /// Publish a `del` for the stored row before each update lands.
    pub invalidate_before_commit: bool,
    /// Broker used instead of the in-memory one.
    pub connector: Option<Arc<dyn BusConnector>>,
    pub reconnect_backoff: Duration,
}

pub struct Harness {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub backend: CacheBackend,
    pub broker: MemoryBroker,
    pub bus: Arc<BusConnection>,
    pub repo: Arc<CountingRepo>,
    pub articles: Arc<ArticleService>,
    cache: CacheState,
}

impl Harness {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_options(config, Options::default())
    }

    pub fn with_options(config: CacheConfig, options: Options) -> Self {
        let store = Arc::new(MemoryStore::new(NonZeroUsize::new(64).expect("non-zero")));
        let backend = CacheBackend::new(store.clone(), Duration::from_millis(200));

        let broker = MemoryBroker::new();
        let connector = options
            .connector
            .unwrap_or_else(|| Arc::new(broker.clone()) as Arc<dyn BusConnector>);
        let bus = Arc::new(
            BusConnection::new(
                connector,
                DEFAULT_BUS_TOPIC,
                Duration::from_millis(200),
                Duration::from_millis(200),
            )
            .with_reconnect_backoff(options.reconnect_backoff),
        );
        let publisher = Arc::new(InvalidationPublisher::new(Arc::clone(&bus)));

        let signals = Arc::new(SignalBus::new());
        register_signal_hooks(
            &signals,
            Arc::clone(&publisher),
            options.invalidate_before_commit,
        );

        let repo = Arc::new(CountingRepo {
            inner: MemoryRepository::new(signals),
            reads: AtomicUsize::new(0),
        });
        let articles = Arc::new(ArticleService::new(repo.clone()));

        let cache = CacheState::new(config, backend.clone()).with_publisher(publisher);
        let router = build_router(HttpState {
            articles: Arc::clone(&articles),
            bus: Arc::clone(&bus),
            cache: Some(cache.clone()),
        });

        Self {
            router,
            store,
            backend,
            broker,
            bus,
            repo,
            articles,
            cache,
        }
    }

    pub fn consumer(&self) -> InvalidationConsumer {
        InvalidationConsumer::new(self.backend.clone())
    }

    pub async fn publish_article(&self, title: &str) -> Article {
        self.articles
            .create(draft(title, true))
            .await
            .expect("article saved")
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.send(get_request(uri, HeaderMap::new())).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        // Dependencies register in the background; settle them so tests can
        // inspect the broker right after a request.
        self.cache.flush_registrations().await;
        TestResponse {
            status,
            headers,
            body,
        }
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn get_request(uri: &str, headers: HeaderMap) -> Request<Body> {
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("valid request");
    *request.headers_mut() = headers;
    request
}

pub fn draft(title: &str, published: bool) -> ArticleDraft {
    ArticleDraft {
        title: title.to_string(),
        section: "news".to_string(),
        body: "Opening paragraph.\n\nSecond paragraph.".to_string(),
        published,
    }
}
