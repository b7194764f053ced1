//! Minimal HTTP client abstraction shared across crates.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

/// Default bound applied to every outbound call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// HTTP client trait for sending raw HTTP requests.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait HttpClient {
    /// Error type returned by the HTTP client
    type Error: std::error::Error + Display + Send + Sync + 'static;

    /// Send an HTTP request and return the response.
    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>>;
}

/// Send a request, giving up after `timeout`.
///
/// Dropping the returned future cancels the call, so callers can layer their own
/// deadline on top of this one.
pub async fn send_with_timeout<C>(
    client: &C,
    request: http::Request<Vec<u8>>,
    timeout: Duration,
) -> Result<http::Response<Vec<u8>>, TransportError>
where
    C: HttpClient + ?Sized,
{
    match tokio::time::timeout(timeout, client.send_http(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(TransportError::Other(Box::new(e))),
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "outbound request timed out");
            Err(TransportError::Timeout)
        }
    }
}

/// Build a reqwest client with the default per-request timeout applied.
#[cfg(all(feature = "reqwest-client", not(target_arch = "wasm32")))]
pub fn default_reqwest_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(TransportError::from)
}

#[cfg(feature = "reqwest-client")]
impl HttpClient for reqwest::Client {
    type Error = reqwest::Error;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
        let (parts, body) = request.into_parts();

        let mut req = self.request(parts.method, parts.uri.to_string()).body(body);

        for (name, value) in parts.headers.iter() {
            req = req.header(name.as_str(), value.as_bytes());
        }

        let resp = req.send().await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();

        // Assembled from parts so a response can never fail to build.
        let mut response = http::Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl<T: HttpClient + Sync> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> + Send
    {
        self.as_ref().send_http(request)
    }
}

#[cfg(target_arch = "wasm32")]
impl<T: HttpClient> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> {
        self.as_ref().send_http(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    impl HttpClient for Stalled {
        type Error = std::convert::Infallible;

        async fn send_http(
            &self,
            _request: http::Request<Vec<u8>>,
        ) -> Result<http::Response<Vec<u8>>, Self::Error> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(http::Response::new(Vec::new()))
        }
    }

    struct Echo;

    impl HttpClient for Echo {
        type Error = std::convert::Infallible;

        async fn send_http(
            &self,
            request: http::Request<Vec<u8>>,
        ) -> Result<http::Response<Vec<u8>>, Self::Error> {
            Ok(http::Response::new(request.into_body()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_call_times_out() {
        let req = http::Request::new(Vec::new());
        let err = send_with_timeout(&Stalled, req, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let req = http::Request::new(b"ping".to_vec());
        let resp = send_with_timeout(&Echo, req, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(resp.body(), b"ping");
    }
}
