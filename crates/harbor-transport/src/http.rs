use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;

use crate::{Outbound, SENDER_HEADER, Transport, TransportError};

/// `Transport` over plain HTTP POSTs to `{receiver}{class path}`.
#[derive(Clone, Default)]
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, outbound: Outbound) -> Result<String, TransportError> {
        let url = format!(
            "{}{}",
            outbound.receiver.trim_end_matches('/'),
            outbound.class.path()
        );
        let res = self
            .http
            .post(&url)
            .header(SENDER_HEADER, &outbound.sender)
            .header(CONTENT_TYPE, "application/json")
            .timeout(outbound.timeout)
            .body(outbound.body)
            .send()
            .await
            .map_err(|err| classify(err, &url))?;

        let status = res.status();
        let body = res.text().await.map_err(|err| classify(err, &url))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(TransportError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn classify(err: reqwest::Error, url: &str) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Unreachable(url.to_string())
    } else {
        TransportError::Http(err)
    }
}
