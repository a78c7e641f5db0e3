// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 CVAT Export Contributors. All Rights Reserved.

use crate::{
    Error, ExportAction, ExportApi, ExportRequest, ExportStatus, TaskId, TaskPage,
    retry::{create_retry_policy, log_retry_configuration},
};
use async_trait::async_trait;
use log::{Level, debug, error, log_enabled, trace};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use url::Url;

/// Server used when none is configured.
pub const DEFAULT_SERVER: &str = "http://localhost:8080/";

#[derive(Serialize)]
struct LoginParams<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResult {
    key: String,
}

#[derive(Deserialize)]
struct AboutResult {
    version: String,
}

#[derive(Deserialize)]
struct TaskSummary {
    id: u64,
}

#[derive(Deserialize)]
struct TasksListResult {
    next: Option<String>,
    results: Vec<TaskSummary>,
}

/// Client for the CVAT REST API.
///
/// Implements [`ExportApi`], so it can be handed to the
/// [`ExportOrchestrator`](crate::ExportOrchestrator) and the
/// [`TaskIndex`](crate::TaskIndex).
///
/// Every request goes through a single `reqwest` client with the retry
/// policy from [`create_retry_policy`], so transient network and server
/// errors are retried below the export state machine.
///
/// # Examples
///
/// ```no_run
/// use cvat_export::Client;
///
/// # async fn example() -> Result<(), cvat_export::Error> {
/// let client = Client::new()?
///     .with_server("https://app.cvat.ai")?
///     .with_login("user", "password")
///     .await?
///     .with_organization("my-team");
///
/// println!("CVAT {}", client.version().await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    url: Url,
    token: Option<String>,
    organization: Option<String>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.url.as_str())
            .field("organization", &self.organization)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl Client {
    /// Create an unauthenticated client for [`DEFAULT_SERVER`].
    ///
    /// The request timeout defaults to 30 seconds and can be changed with
    /// the `CVAT_TIMEOUT` environment variable (in seconds).
    pub fn new() -> Result<Self, Error> {
        log_retry_configuration();

        let timeout_secs = std::env::var("CVAT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .retry(create_retry_policy())
            .build()?;

        Ok(Client {
            http,
            url: Url::parse(DEFAULT_SERVER)?,
            token: None,
            organization: None,
        })
    }

    /// Returns a new client connected to `server`, e.g.
    /// `https://app.cvat.ai`.
    ///
    /// The token is dropped since it belongs to the previous server.
    ///
    /// ```rust
    /// use cvat_export::Client;
    ///
    /// # fn main() -> Result<(), cvat_export::Error> {
    /// let client = Client::new()?.with_server("https://cvat.example.com/cvat")?;
    /// assert_eq!(client.url(), "https://cvat.example.com/cvat/");
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_server(&self, server: &str) -> Result<Self, Error> {
        let server = server.trim();
        let mut url = Url::parse(server)?;
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }

        Ok(Client {
            url,
            token: None,
            ..self.clone()
        })
    }

    /// Returns a new client authenticated with an existing API token.
    pub fn with_token(&self, token: &str) -> Result<Self, Error> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::InvalidParameters("Empty token".to_string()));
        }

        Ok(Client {
            token: Some(token.to_string()),
            ..self.clone()
        })
    }

    /// Returns a new client authenticated with the provided username and
    /// password.
    pub async fn with_login(&self, username: &str, password: &str) -> Result<Self, Error> {
        let url = self.endpoint("api/auth/login")?;
        let res = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .header("User-Agent", user_agent())
            .json(&LoginParams { username, password })
            .send()
            .await?;

        let login: LoginResult = parse_json(check_status(res)?).await?;
        if login.key.is_empty() {
            return Err(Error::InvalidResponse);
        }

        debug!("logged in to {} as {}", self.url, username);
        Ok(Client {
            token: Some(login.key),
            ..self.clone()
        })
    }

    /// Returns a new client scoped to the organization with the given slug.
    ///
    /// Without an organization the personal workspace is used.
    pub fn with_organization(&self, organization: &str) -> Self {
        let organization = organization.trim();
        Client {
            organization: (!organization.is_empty()).then(|| organization.to_string()),
            ..self.clone()
        }
    }

    /// Return the version of the CVAT server.
    pub async fn version(&self) -> Result<String, Error> {
        let about: AboutResult = self.get_json("api/server/about", &[]).await?;
        Ok(about.version)
    }

    /// Base URL of the server, always ending in `/`.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        Ok(self.url.join(path)?)
    }

    /// Adds the common headers and the organization scope to a request.
    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder
            .header("Accept", "application/json")
            .header("User-Agent", user_agent());

        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Token {}", token));
        }
        if let Some(organization) = &self.organization {
            builder = builder.query(&[("org", organization)]);
        }
        builder
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let res = self
            .authorized(self.http.get(url))
            .query(query)
            .send()
            .await?;
        parse_json(check_status(res)?).await
    }
}

#[async_trait]
impl ExportApi for Client {
    /// Maps the CVAT export endpoints onto [`ExportStatus`]:
    ///
    /// | HTTP | Meaning                              | Status     |
    /// |------|--------------------------------------|------------|
    /// | 202  | export is being prepared             | `Pending`  |
    /// | 201  | export prepared, ready to download   | `Accepted` |
    /// | 200  | archive in the response body         | `Ready`    |
    async fn request_export(&self, request: &ExportRequest) -> Result<ExportStatus, Error> {
        let resource = if request.with_images {
            "dataset"
        } else {
            "annotations"
        };
        let url = self.endpoint(&format!("api/tasks/{}/{}", request.task_id, resource))?;

        let mut query = vec![("format", request.format.wire_name())];
        if request.action == ExportAction::Download {
            query.push(("action", "download"));
        }

        let res = self
            .authorized(self.http.get(url))
            .query(&query)
            .send()
            .await?;

        match res.status() {
            StatusCode::ACCEPTED => Ok(ExportStatus::Pending),
            StatusCode::CREATED => Ok(ExportStatus::Accepted),
            StatusCode::OK => {
                let body = res.bytes().await?;
                trace!(
                    "task {}: received {} byte archive",
                    request.task_id,
                    body.len()
                );
                Ok(ExportStatus::Ready(body.to_vec()))
            }
            _ => {
                check_status(res)?;
                Err(Error::InvalidResponse)
            }
        }
    }

    async fn list_tasks(&self, page: u32, page_size: u32) -> Result<TaskPage, Error> {
        let result: TasksListResult = self
            .get_json(
                "api/tasks",
                &[
                    ("page", page.to_string()),
                    ("page_size", page_size.to_string()),
                ],
            )
            .await?;

        Ok(TaskPage {
            ids: result
                .results
                .into_iter()
                .map(|t| TaskId::try_from(t.id))
                .collect::<Result<_, _>>()?,
            has_next: result.next.is_some(),
        })
    }
}

fn user_agent() -> String {
    format!("cvat-export/{}", env!("CARGO_PKG_VERSION"))
}

/// Maps authentication failures to [`Error::Unauthorized`] and any other
/// error status to [`Error::HttpError`].
fn check_status(res: Response) -> Result<Response, Error> {
    match res.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized),
        _ => Ok(res.error_for_status()?),
    }
}

async fn parse_json<T>(res: Response) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    let body = res.bytes().await?;

    if log_enabled!(Level::Trace) {
        trace!("Response: {}", String::from_utf8_lossy(&body));
    }

    match serde_json::from_slice(&body) {
        Ok(result) => Ok(result),
        Err(err) => {
            error!("Invalid JSON Response: {}", String::from_utf8_lossy(&body));
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExportFormat, TaskIndex};
    use std::sync::Arc;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param, query_param_is_missing},
    };

    fn client_for(server: &MockServer) -> Client {
        Client::new()
            .unwrap()
            .with_server(&server.uri())
            .unwrap()
            .with_token("secret")
            .unwrap()
    }

    fn export_request(task_id: u64, with_images: bool, action: ExportAction) -> ExportRequest {
        ExportRequest {
            task_id: TaskId::try_from(task_id).unwrap(),
            format: ExportFormat::Yolo,
            with_images,
            action,
        }
    }

    #[test]
    fn test_with_server_normalizes_trailing_slash() {
        let client = Client::new().unwrap();
        assert_eq!(client.url(), DEFAULT_SERVER);

        let client = client.with_server("https://cvat.example.com").unwrap();
        assert_eq!(client.url(), "https://cvat.example.com/");

        let client = client.with_server("https://cvat.example.com/sub/").unwrap();
        assert_eq!(client.url(), "https://cvat.example.com/sub/");
    }

    #[test]
    fn test_with_server_rejects_invalid_url() {
        assert!(matches!(
            Client::new().unwrap().with_server("not a url"),
            Err(Error::UrlParseError(_))
        ));
    }

    #[test]
    fn test_with_server_drops_token() {
        let client = Client::new().unwrap().with_token("abc").unwrap();
        assert!(client.is_authenticated());
        let client = client.with_server("https://other.example.com").unwrap();
        assert!(!client.is_authenticated());
    }

    #[test]
    fn test_with_token_rejects_empty() {
        assert!(Client::new().unwrap().with_token("  ").is_err());
    }

    #[test]
    fn test_with_organization() {
        let client = Client::new().unwrap().with_organization("team");
        assert_eq!(client.organization(), Some("team"));
        assert_eq!(client.with_organization("").organization(), None);
    }

    #[test]
    fn test_debug_hides_token() {
        let client = Client::new().unwrap().with_token("top-secret").unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("top-secret"));
        assert!(debug.contains("authenticated: true"));
    }

    #[tokio::test]
    async fn test_login_uses_returned_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(body_json(
                serde_json::json!({"username": "alice", "password": "pw"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"key": "k123"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/server/about"))
            .and(header("Authorization", "Token k123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "CVAT", "version": "2.21.0"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new()
            .unwrap()
            .with_server(&server.uri())
            .unwrap()
            .with_login("alice", "pw")
            .await
            .unwrap();
        assert_eq!(client.version().await.unwrap(), "2.21.0");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = Client::new()
            .unwrap()
            .with_server(&server.uri())
            .unwrap()
            .with_login("alice", "wrong")
            .await;
        assert!(matches!(result, Err(Error::Unauthorized)));
    }

    #[tokio::test]
    async fn test_export_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/1/annotations"))
            .and(query_param("format", "YOLO 1.1"))
            .and(query_param_is_missing("action"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/2/annotations"))
            .and(query_param_is_missing("action"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/2/annotations"))
            .and(query_param("action", "download"))
            .and(header("Authorization", "Token secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK archive".to_vec()))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(
            client
                .request_export(&export_request(1, false, ExportAction::Prepare))
                .await
                .unwrap(),
            ExportStatus::Pending
        );
        assert_eq!(
            client
                .request_export(&export_request(2, false, ExportAction::Prepare))
                .await
                .unwrap(),
            ExportStatus::Accepted
        );
        assert_eq!(
            client
                .request_export(&export_request(2, false, ExportAction::Download))
                .await
                .unwrap(),
            ExportStatus::Ready(b"PK archive".to_vec())
        );
    }

    #[tokio::test]
    async fn test_export_with_images_uses_dataset_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/5/dataset"))
            .and(query_param("format", "YOLO 1.1"))
            .and(query_param("org", "team"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).with_organization("team");
        let status = client
            .request_export(&export_request(5, true, ExportAction::Prepare))
            .await
            .unwrap();
        assert_eq!(status, ExportStatus::Pending);
    }

    #[tokio::test]
    async fn test_export_forbidden_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/3/annotations"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .request_export(&export_request(3, false, ExportAction::Prepare))
            .await;
        assert!(matches!(result, Err(Error::Unauthorized)));
    }

    #[tokio::test]
    async fn test_export_missing_task_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks/404/annotations"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .request_export(&export_request(404, false, ExportAction::Prepare))
            .await;
        assert!(matches!(result, Err(Error::HttpError(_))));
    }

    #[tokio::test]
    async fn test_task_index_pages_through_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .and(query_param("page", "1"))
            .and(query_param("page_size", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 3,
                "next": "http://localhost/api/tasks?page=2&page_size=2",
                "previous": null,
                "results": [{"id": 10, "name": "a"}, {"id": 11, "name": "b"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 3,
                "next": null,
                "previous": "http://localhost/api/tasks?page=1&page_size=2",
                "results": [{"id": 12, "name": "c"}]
            })))
            .mount(&server)
            .await;

        let index = TaskIndex::new(Arc::new(client_for(&server))).with_page_size(2);
        let ids = index.list_all().await.unwrap();
        assert_eq!(
            ids,
            vec![TaskId::try_from(10u64).unwrap(), TaskId::try_from(11u64).unwrap(), TaskId::try_from(12u64).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_list_tasks_invalid_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let result = client_for(&server).list_tasks(1, 100).await;
        assert!(matches!(result, Err(Error::JsonError(_))));
    }
}
