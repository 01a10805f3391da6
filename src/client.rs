use crate::AsyncRuntime;
use crate::body::BodyProducer;
use crate::config::ClientConfig;
use crate::context::RequestContext;
use crate::error::TransportError;
use crate::executor::RequestExecutor;
use crate::handler::ResponseHandler;
use crate::pipeline::PipelineInitializer;
use crate::pool::{ChannelPool, HttpOrHttp2Pool, SimplePool};
use crate::transport::TransportPlugin;
use dashmap::DashMap;
use http::{Request, Uri};
use std::sync::Arc;
use tracing::debug;

struct ClientInner<T, R> {
    transport: Arc<T>,
    runtime: R,
    config: ClientConfig,
    pools: DashMap<String, Arc<dyn ChannelPool>>,
}

/// The asynchronous HTTP client.
///
/// Keeps one pool stack per destination (scheme and authority), created on
/// first use. Cheap to clone; clones share the pools.
pub struct AsyncHttpClient<T, R> {
    inner: Arc<ClientInner<T, R>>,
}

impl<T, R> Clone for AsyncHttpClient<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> AsyncHttpClient<T, R>
where
    T: TransportPlugin,
    R: AsyncRuntime,
{
    pub fn new(transport: T, runtime: R, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport: Arc::new(transport),
                runtime,
                config,
                pools: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Builds the executor for `request` without starting it.
    ///
    /// The request URI must be absolute; it selects the pool.
    pub fn prepare_request<P, H>(
        &self,
        request: Request<()>,
        producer: P,
        handler: H,
    ) -> anyhow::Result<RequestExecutor<R>>
    where
        P: BodyProducer,
        H: ResponseHandler,
    {
        let pool = self.pool_for(request.uri())?;
        let context = RequestContext::new(pool, request, producer, handler);
        Ok(RequestExecutor::new(context, self.inner.runtime.clone()))
    }

    /// Prepares and runs `request`.
    pub fn execute<P, H>(
        &self,
        request: Request<()>,
        producer: P,
        handler: H,
    ) -> anyhow::Result<RequestExecutor<R>>
    where
        P: BodyProducer,
        H: ResponseHandler,
    {
        let executor = self.prepare_request(request, producer, handler)?;
        executor.run();
        Ok(executor)
    }

    /// The pool stack for the destination of `uri`.
    pub fn pool_for(&self, uri: &Uri) -> anyhow::Result<Arc<dyn ChannelPool>> {
        let (Some(scheme), Some(authority)) = (uri.scheme(), uri.authority()) else {
            let message = format!("request URI `{uri}` is not absolute");
            return Err(TransportError::Protocol(message).into());
        };
        let key = format!("{scheme}://{authority}");
        if let Some(pool) = self.inner.pools.get(&key) {
            return Ok(pool.clone());
        }

        let destination = Uri::builder()
            .scheme(scheme.clone())
            .authority(authority.clone())
            .path_and_query("/")
            .build()?;
        let pool = self
            .inner
            .pools
            .entry(key)
            .or_insert_with(|| self.new_pool(destination))
            .clone();
        Ok(pool)
    }

    /// Closes every pool. Requests still in flight fail.
    pub fn close(&self) {
        debug!(pools = self.inner.pools.len(), "closing client");
        for entry in self.inner.pools.iter() {
            entry.value().close();
        }
        self.inner.pools.clear();
    }

    fn new_pool(&self, destination: Uri) -> Arc<dyn ChannelPool> {
        debug!(%destination, "creating pool");
        let initializer = PipelineInitializer::new(self.inner.runtime.clone(), &self.inner.config);
        let physical = SimplePool::new(self.inner.transport.clone(), destination, initializer);
        Arc::new(HttpOrHttp2Pool::new(
            Arc::new(physical),
            &self.inner.config,
            self.inner.runtime.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRuntime;
    use crate::transport::BidiStream;

    struct Unreachable;

    struct NoIo;

    impl futures_lite::io::AsyncRead for NoIo {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &mut [u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(0))
        }
    }

    impl futures_lite::io::AsyncWrite for NoIo {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl BidiStream for NoIo {}

    impl TransportPlugin for Unreachable {
        type Io = NoIo;

        async fn connect(&self, uri: &Uri) -> anyhow::Result<NoIo> {
            anyhow::bail!("{uri} is unreachable")
        }
    }

    fn client() -> AsyncHttpClient<Unreachable, TestRuntime> {
        AsyncHttpClient::new(Unreachable, TestRuntime, ClientConfig::default())
    }

    #[tokio::test]
    async fn pools_are_shared_per_destination() {
        let client = client();

        let a = client.pool_for(&"http://example.com/a".parse().unwrap()).unwrap();
        let b = client.pool_for(&"http://example.com/b?x=1".parse().unwrap()).unwrap();
        let other_port = client.pool_for(&"http://example.com:8080/".parse().unwrap()).unwrap();
        let https = client.pool_for(&"https://example.com/".parse().unwrap()).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other_port));
        assert!(!Arc::ptr_eq(&a, &https));
    }

    #[tokio::test]
    async fn relative_uri_is_rejected() {
        let client = client();
        let request = Request::get("/relative").body(()).unwrap();

        let error = client
            .prepare_request(request, crate::EmptyBody, crate::testing::Recorder::default())
            .unwrap_err();

        assert!(error.to_string().contains("not absolute"));
    }

    #[tokio::test]
    async fn close_drops_the_pools() {
        let client = client();
        let before = client.pool_for(&"http://example.com/".parse().unwrap()).unwrap();

        client.close();
        let after = client.pool_for(&"http://example.com/".parse().unwrap()).unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
    }
}
