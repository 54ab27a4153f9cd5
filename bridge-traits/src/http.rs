//! HTTP Client Abstraction
//!
//! Provides streaming downloads. Redirects, TLS and status handling are the
//! implementation's concern.

use async_trait::async_trait;

use crate::error::Result;

/// Async HTTP client trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::HttpClient;
///
/// async fn fetch(client: &dyn HttpClient, out: &mut (dyn tokio::io::AsyncWrite + Unpin)) -> Result<u64> {
///     let mut body = client.download_stream("https://example.com/001.mp3").await?;
///     Ok(tokio::io::copy(&mut body, out).await?)
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue a GET request and expose the response body as a byte stream
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Network connection fails
    /// - The response status is not 2xx
    async fn download_stream(
        &self,
        url: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>>;
}
