mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use crate::error::FeedError;

fn get_request(url: &str) -> Result<reqwest::Request, FeedError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| FeedError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    Ok(reqwest::Request::new(reqwest::Method::GET, parsed))
}

/// GETs `url` and returns the response body as text.
///
/// # Errors
///
/// Fails on transport errors and on any non-2xx status.
pub async fn fetch_text<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<String, FeedError> {
    let resp = client.execute(get_request(url)?).await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FeedError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(resp.text().await?)
}

/// GETs `url` and returns the raw response, leaving status handling to the caller.
pub async fn fetch_response<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<reqwest::Response, FeedError> {
    Ok(client.execute(get_request(url)?).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_request_rejects_garbage_url() {
        let err = get_request("not a url").unwrap_err();
        assert!(matches!(err, FeedError::InvalidUrl { .. }));
    }

    #[test]
    fn test_get_request_keeps_query() {
        let req = get_request("https://example.org/data.csv?a,b&time>=2026-02-20T00:00:00Z").unwrap();
        assert_eq!(req.method(), reqwest::Method::GET);
        assert_eq!(req.url().path(), "/data.csv");
        assert!(req.url().query().unwrap().starts_with("a,b&time"));
    }
}
