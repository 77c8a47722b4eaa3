//! HTTP client for the Boxcar instance control plane.
//!
//! Requests are retried with exponential backoff on transport failures;
//! non-2xx responses are never retried here and propagate to the caller
//! with their status and body.

use std::time::Duration;

use backoff::ExponentialBackoff;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::provider::ProviderError;

const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(60);

/// Instance record returned by the control plane.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct InstancePayload {
    /// Server-issued instance id.
    pub id: String,
    /// Addresses assigned to the instance; the first IPv4 one is used.
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<String>,
    /// Lifecycle state reported by the control plane.
    #[serde(default)]
    pub state: String,
    /// Image the instance was booted from.
    #[serde(rename = "base-image", default)]
    pub base_image: Option<String>,
    /// Resource type tag.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DataResponse {
    data: Vec<InstancePayload>,
}

#[derive(Serialize)]
struct CreateBody<'a> {
    data: CreateData<'a>,
}

#[derive(Serialize)]
struct CreateData<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(rename = "base-image")]
    base_image: &'a str,
}

/// Authenticated client for one control plane endpoint.
///
/// A bearer token embedded in the userinfo portion of the endpoint URL is
/// stripped from the URL and injected as `Authorization: token <t>` on
/// every request.
#[derive(Clone, Debug)]
pub(crate) struct ApiClient {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    /// Parses the endpoint and extracts the auth token.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the endpoint is not a usable
    /// absolute URL.
    pub(crate) fn new(endpoint: &str) -> Result<Self, ProviderError> {
        let mut base = Url::parse(endpoint)
            .map_err(|err| ProviderError::Config(format!("invalid ENDPOINT: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(ProviderError::Config(String::from(
                "invalid ENDPOINT: not a base URL",
            )));
        }
        let token = match base.username() {
            "" => None,
            token => Some(token.to_owned()),
        };
        base.set_username("")
            .and_then(|()| base.set_password(None))
            .map_err(|()| ProviderError::Config(String::from("invalid ENDPOINT: bad userinfo")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_interval: RETRY_MAX_INTERVAL,
            max_elapsed_time: Some(RETRY_MAX_ELAPSED),
            ..ExponentialBackoff::default()
        }
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<(&'static str, Vec<u8>)>,
    ) -> Result<reqwest::Response, ProviderError> {
        backoff::future::retry(Self::retry_policy(), || async {
            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(token) = &self.token {
                request = request.header(AUTHORIZATION, format!("token {token}"));
            }
            if let Some((content_type, bytes)) = &body {
                request = request
                    .header(CONTENT_TYPE, *content_type)
                    .body(bytes.clone());
            }
            request.send().await.map_err(|err| {
                backoff::Error::transient(ProviderError::Http {
                    message: err.to_string(),
                })
            })
        })
        .await
    }

    async fn decode_instance(response: reqwest::Response) -> Result<InstancePayload, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let payload: DataResponse =
            response
                .json()
                .await
                .map_err(|err| ProviderError::Payload {
                    message: err.to_string(),
                })?;
        payload
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Payload {
                message: String::from("empty data array"),
            })
    }

    /// Requests a new instance booted from `base_image`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Api`] on non-2xx responses and
    /// [`ProviderError::Http`] when the control plane is unreachable.
    pub(crate) async fn create_instance(
        &self,
        base_image: &str,
    ) -> Result<InstancePayload, ProviderError> {
        let body = serde_json::to_vec(&CreateBody {
            data: CreateData {
                kind: "instances",
                base_image,
            },
        })
        .map_err(|err| ProviderError::Payload {
            message: err.to_string(),
        })?;
        let response = self
            .send(
                Method::POST,
                self.endpoint(&["instances"]),
                Some(("application/vnd.api+json", body)),
            )
            .await?;
        Self::decode_instance(response).await
    }

    /// Fetches the current state of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Api`] on non-2xx responses and
    /// [`ProviderError::Http`] when the control plane is unreachable.
    pub(crate) async fn get_instance(&self, id: &str) -> Result<InstancePayload, ProviderError> {
        let response = self
            .send(Method::GET, self.endpoint(&["instances", id]), None)
            .await?;
        Self::decode_instance(response).await
    }

    /// Releases an instance. Best effort: the response body is drained and
    /// a non-2xx status is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Http`] when the request cannot be sent.
    pub(crate) async fn delete_instance(&self, id: &str) -> Result<(), ProviderError> {
        let response = self
            .send(Method::DELETE, self.endpoint(&["instances", id]), None)
            .await?;
        let status = response.status();
        let _ = response.bytes().await;
        if !status.is_success() {
            tracing::debug!(instance_id = id, status = status.as_u16(), "instance delete refused");
        }
        Ok(())
    }
}
