//! HTTP plumbing shared by all API calls.
//!
//! Two endpoint families exist: RPC endpoints on `api.dropboxapi.com` take a
//! JSON body; content endpoints on `content.dropboxapi.com` take the
//! serialized argument in the `Dropbox-API-Arg` header and the payload as an
//! `application/octet-stream` body.

use crate::error::{ApiError, ApiResult, ErrorResponse};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Per-call timeout for regular requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Per-call timeout for long-poll style requests (batch job checks)
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Dropbox API client bound to one access token
pub struct Client {
    http: reqwest::Client,
    long_poll_http: reqwest::Client,
    token: String,
}

impl Client {
    pub fn new(token: impl Into<String>) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ApiError::from)?;
        let long_poll_http = reqwest::Client::builder()
            .timeout(LONG_POLL_TIMEOUT)
            .build()
            .map_err(ApiError::from)?;

        Ok(Self {
            http,
            long_poll_http,
            token: token.into(),
        })
    }

    /// Call an RPC endpoint with a JSON body
    pub async fn rpc<A, R>(&self, route: &str, arg: &A) -> ApiResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.rpc_with(&self.http, route, arg).await
    }

    /// Call an RPC endpoint on the long-poll client (batch job checks)
    pub async fn rpc_long_poll<A, R>(&self, route: &str, arg: &A) -> ApiResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.rpc_with(&self.long_poll_http, route, arg).await
    }

    async fn rpc_with<A, R>(&self, http: &reqwest::Client, route: &str, arg: &A) -> ApiResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        debug!(target: "api", route, "RPC request");
        let response = http
            .post(format!("{API_BASE}/{route}"))
            .bearer_auth(&self.token)
            .json(arg)
            .send()
            .await?;

        Self::decode(response, false).await
    }

    /// Call a content endpoint: argument in the `Dropbox-API-Arg` header,
    /// payload as the request body
    pub async fn content<A, R>(
        &self,
        route: &str,
        arg: &A,
        body: Bytes,
        session_route: bool,
    ) -> ApiResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let api_arg = header_safe_json(arg)?;
        debug!(target: "api", route, body_len = body.len(), "content request");

        let response = self
            .http
            .post(format!("{CONTENT_BASE}/{route}"))
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", api_arg)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        Self::decode(response, session_route).await
    }

    async fn decode<R: DeserializeOwned>(
        response: reqwest::Response,
        session_route: bool,
    ) -> ApiResult<R> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            // Some routes answer with an empty body or literal `null`;
            // deserialize those through Value so `R = ()` style results work.
            if text.trim().is_empty() || text.trim() == "null" {
                return serde_json::from_str("null").map_err(ApiError::from);
            }
            return serde_json::from_str(&text).map_err(ApiError::from);
        }

        match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(envelope) => Err(ApiError::from_response(
                status.as_u16(),
                envelope,
                session_route,
            )),
            Err(_) => {
                warn!(target: "api", status = status.as_u16(), "undecodable error body");
                Err(ApiError::Api {
                    status: status.as_u16(),
                    summary: text,
                    detail: None,
                })
            }
        }
    }
}

/// Serialize an API argument for use in an HTTP header.
///
/// Header values must be ASCII; non-ASCII characters in paths are escaped as
/// `\uXXXX` sequences, which the server accepts inside the JSON.
fn header_safe_json<A: Serialize + ?Sized>(arg: &A) -> ApiResult<String> {
    let json = serde_json::to_string(arg)?;
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if (' '..='\u{7e}').contains(&c) {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut [0u16; 2]) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Arg {
        path: String,
    }

    #[test]
    fn header_json_escapes_non_ascii() {
        let arg = Arg {
            path: "/fôlder/日本".to_string(),
        };
        let s = header_safe_json(&arg).unwrap();
        assert!(s.is_ascii());
        assert!(s.contains("\\u00f4"));
        assert!(s.contains("\\u65e5"));
    }

    #[test]
    fn header_json_passes_ascii_through() {
        let arg = Arg {
            path: "/plain/path.txt".to_string(),
        };
        assert_eq!(
            header_safe_json(&arg).unwrap(),
            "{\"path\":\"/plain/path.txt\"}"
        );
    }
}
