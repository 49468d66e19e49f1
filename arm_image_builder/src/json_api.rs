use crate::arm::{ArmError, ErrorEnvelope};
use crate::retry::{OpError, OpResult};
use crate::{op_fatal, op_transient};
use anyhow::Result;
use log::debug;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, LOCATION, USER_AGENT,
};
use reqwest::{Client, Method, Request, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error;
use std::time::Duration;

const AZURE_ASYNC_OPERATION: HeaderName = HeaderName::from_static("azure-asyncoperation");

/// A decoded response, with the long-running operation URL if ARM sent one.
#[derive(Debug, Clone)]
pub struct JsonResponse<T> {
    pub status: u16,
    /// `Azure-AsyncOperation`, else `Location`
    pub async_operation: Option<String>,
    /// `None` for an empty body
    pub body: Option<T>,
}

impl<T> JsonResponse<T> {
    /// The body, failing when the response was empty
    pub fn require(self, what: &str) -> OpResult<T> {
        match self.body {
            Some(b) => Ok(b),
            None => op_fatal!("Empty response body for {}", what),
        }
    }
}

/// Bearer-token JSON client for the ARM REST API.
#[derive(Clone)]
pub struct JsonApi {
    client: Client,
    base: Url,
    /// Log request and response bodies at debug level
    log_requests: bool,
}

impl JsonApi {
    pub fn token(base: &str, token: &str, log_requests: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "arm-image-builder/1.0".parse()?);
        headers.insert(AUTHORIZATION, format!("Bearer {}", token).parse()?);
        headers.insert(ACCEPT, "application/json; charset=utf-8".parse()?);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base: base.parse()?,
            log_requests,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, api_version: &str) -> OpResult<T> {
        self.req::<T, ()>(Method::GET, path, api_version, None)
            .await?
            .require(path)
    }

    pub async fn post<T: DeserializeOwned, R: Serialize>(
        &self,
        path: &str,
        api_version: &str,
        body: Option<R>,
    ) -> OpResult<JsonResponse<T>> {
        self.req(Method::POST, path, api_version, body).await
    }

    pub async fn put<T: DeserializeOwned, R: Serialize>(
        &self,
        path: &str,
        api_version: &str,
        body: R,
    ) -> OpResult<JsonResponse<T>> {
        self.req(Method::PUT, path, api_version, Some(body)).await
    }

    pub async fn delete(&self, path: &str, api_version: &str) -> OpResult<JsonResponse<()>> {
        self.req::<(), ()>(Method::DELETE, path, api_version, None)
            .await
    }

    /// Fetch an absolute URL handed out by ARM, such as an async operation status
    pub async fn get_url<T: DeserializeOwned>(&self, url: &str) -> OpResult<JsonResponse<T>> {
        let url: Url = match url.parse() {
            Ok(u) => u,
            Err(e) => op_fatal!("Invalid operation url {}: {}", url, e),
        };
        let req = match self.client.request(Method::GET, url.clone()).build() {
            Ok(r) => r,
            Err(e) => op_fatal!("Failed to build request: {}", e),
        };
        self.execute(req, url.path()).await
    }

    pub fn build_req(
        &self,
        method: Method,
        path: &str,
        api_version: &str,
        body: Option<impl Serialize>,
    ) -> Result<Request> {
        let mut url = self.base.join(path)?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        let req = self.client.request(method.clone(), url);
        let req = if let Some(body) = body {
            let body = serde_json::to_string(&body)?;
            if self.log_requests {
                debug!(">> {} {}: {}", method, path, &body);
            }
            req.header(CONTENT_TYPE, "application/json; charset=utf-8")
                .body(body)
                .build()?
        } else {
            if self.log_requests {
                debug!(">> {} {}", method, path);
            }
            req.build()?
        };
        Ok(req)
    }

    pub async fn req<T: DeserializeOwned, R: Serialize>(
        &self,
        method: Method,
        path: &str,
        api_version: &str,
        body: Option<R>,
    ) -> OpResult<JsonResponse<T>> {
        let req = match self.build_req(method, path, api_version, body) {
            Ok(r) => r,
            Err(e) => op_fatal!("Failed to build request for {}: {}", path, e),
        };
        self.execute(req, path).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        req: Request,
        path: &str,
    ) -> OpResult<JsonResponse<T>> {
        let method = req.method().clone();
        let rsp = match self.client.execute(req).await {
            Ok(rsp) => rsp,
            Err(e) => {
                op_transient!(
                    "Failed to send request: {} source={}",
                    e,
                    e.source()
                        .map(|x| x.to_string())
                        .unwrap_or_else(|| "None".to_owned())
                );
            }
        };

        let status = rsp.status();
        let async_operation = header(rsp.headers(), &AZURE_ASYNC_OPERATION)
            .or_else(|| header(rsp.headers(), &LOCATION));
        let text = rsp
            .text()
            .await
            .map_err(|e| OpError::Transient(ArmError::network(e.to_string())))?;
        if self.log_requests {
            debug!("<< {} {}: {}", status, path, text);
        }

        if status.is_success() {
            let body = if text.trim().is_empty() {
                None
            } else {
                match serde_json::from_str(&text) {
                    Ok(t) => Some(t),
                    Err(e) => op_fatal!("Failed to parse JSON from {}: {} {}", path, text, e),
                }
            };
            Ok(JsonResponse {
                status: status.as_u16(),
                async_operation,
                body,
            })
        } else {
            Err(OpError::Fatal(provider_error(
                status.as_u16(),
                &method,
                path,
                &text,
            )))
        }
    }
}

fn header(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decode the ARM error envelope, falling back to the raw body
fn provider_error(status: u16, method: &Method, path: &str, text: &str) -> ArmError {
    match serde_json::from_str::<ErrorEnvelope>(text) {
        Ok(e) => ArmError::new(status, e.error.code, e.error.message),
        Err(_) => {
            let code = match status {
                404 => "NotFound",
                409 => "Conflict",
                429 => "TooManyRequests",
                500..=599 => "InternalServerError",
                _ => "BadRequest",
            };
            ArmError::new(status, code, format!("{} {}: {}", method, path, text))
        }
    }
}
