//! Write endpoint adapter for the workspace app's REST routes:
//!
//! - `POST  /api/project/{projectId}/message` with `{uuid, content}`
//! - `POST  /api/message/read` with `{messageId}`
//! - `POST  /api/task/create` with the task fields
//! - `PATCH /api/task/{id}` with the changed fields

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::{Method, Url};
use serde_json::{Map, Value};
use tracing::debug;

use super::{EntityWriter, WriteAck, WriteRequest};
use crate::constants::{fields, SCOPE_FIELD};
use crate::error::WriteError;
use crate::models::{MutationKind, Table};

/// Resolved HTTP call for one write
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub method: Method,
    pub url: Url,
    pub body: Value,
}

pub struct HttpEntityWriter {
    base_url: Url,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpEntityWriter {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid backend base URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Backend URL cannot be used as a base: {}", base_url);
        }
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
            bearer_token: None,
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, WriteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| WriteError::Transport {
                message: format!("cannot build a route on {}", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Map a write onto the app's route for it
    pub fn route(&self, request: &WriteRequest) -> Result<Route, WriteError> {
        match (request.table, request.kind) {
            (Table::Message, MutationKind::Create) => {
                let project_id = request
                    .payload
                    .get(SCOPE_FIELD)
                    .and_then(Value::as_str)
                    .ok_or_else(|| WriteError::Rejected {
                        status: 400,
                        message: format!("{} is required", SCOPE_FIELD),
                    })?;
                let content = request
                    .payload
                    .get(fields::CONTENT)
                    .cloned()
                    .unwrap_or(Value::Null);

                let mut body = Map::new();
                body.insert("uuid".to_string(), Value::from(request.entity_id.clone()));
                body.insert(fields::CONTENT.to_string(), content);
                Ok(Route {
                    method: Method::POST,
                    url: self.url(&["api", "project", project_id, "message"])?,
                    body: Value::Object(body),
                })
            }
            (Table::Message, MutationKind::Update) => {
                // The only message update the app exposes is a read receipt
                if !request.payload.contains_key(fields::READ_BY_USER_IDS) {
                    return Err(WriteError::Rejected {
                        status: 405,
                        message: "messages can only be marked as read".to_string(),
                    });
                }
                // The server adds the authenticated user to the readers
                let mut body = request.payload.clone();
                body.remove(fields::READ_BY_USER_IDS);
                body.insert("messageId".to_string(), Value::from(request.entity_id.clone()));
                Ok(Route {
                    method: Method::POST,
                    url: self.url(&["api", "message", "read"])?,
                    body: Value::Object(body),
                })
            }
            (Table::Task, MutationKind::Create) => {
                let mut body = request.payload.clone();
                body.insert(fields::ID.to_string(), Value::from(request.entity_id.clone()));
                Ok(Route {
                    method: Method::POST,
                    url: self.url(&["api", "task", "create"])?,
                    body: Value::Object(body),
                })
            }
            (Table::Task, MutationKind::Update) => Ok(Route {
                method: Method::PATCH,
                url: self.url(&["api", "task", &request.entity_id])?,
                body: Value::Object(request.payload.clone()),
            }),
        }
    }
}

impl EntityWriter for HttpEntityWriter {
    fn write_entity<'a>(
        &'a self,
        request: &'a WriteRequest,
    ) -> BoxFuture<'a, Result<WriteAck, WriteError>> {
        Box::pin(async move {
            let route = self.route(request)?;
            debug!(
                mutation_id = %request.mutation_id,
                method = %route.method,
                url = %route.url,
                "Sending write"
            );

            let mut builder = self
                .client
                .request(route.method, route.url)
                .json(&route.body);
            if let Some(token) = &self.bearer_token {
                builder = builder.bearer_auth(token);
            }

            let response = builder.send().await.map_err(|err| WriteError::Transport {
                message: err.to_string(),
            })?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(WriteError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            Ok(WriteAck {
                entity_id: request.entity_id.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(table: Table, kind: MutationKind, entity_id: &str, payload: Value) -> WriteRequest {
        WriteRequest {
            mutation_id: "mut_1".to_string(),
            table,
            kind,
            entity_id: entity_id.to_string(),
            payload: payload.as_object().cloned().unwrap(),
        }
    }

    fn writer() -> HttpEntityWriter {
        HttpEntityWriter::new("https://app.example.com/").unwrap()
    }

    #[test]
    fn test_message_create_route() {
        let route = writer()
            .route(&request(
                Table::Message,
                MutationKind::Create,
                "11111111-1111-1111-1111-111111111111",
                json!({"content": "Hello team", "projectId": "proj_1"}),
            ))
            .unwrap();

        assert_eq!(route.method, Method::POST);
        assert_eq!(
            route.url.as_str(),
            "https://app.example.com/api/project/proj_1/message"
        );
        assert_eq!(
            route.body,
            json!({"uuid": "11111111-1111-1111-1111-111111111111", "content": "Hello team"})
        );
    }

    #[test]
    fn test_task_routes() {
        let create = writer()
            .route(&request(
                Table::Task,
                MutationKind::Create,
                "task_5",
                json!({"name": "Ship kanban", "projectId": "proj_1", "statusId": "status_todo"}),
            ))
            .unwrap();
        assert_eq!(create.method, Method::POST);
        assert_eq!(create.url.as_str(), "https://app.example.com/api/task/create");
        assert_eq!(create.body["id"], "task_5");

        let update = writer()
            .route(&request(
                Table::Task,
                MutationKind::Update,
                "task_5",
                json!({"statusId": "status_done", "clientMutationId": "mut_1"}),
            ))
            .unwrap();
        assert_eq!(update.method, Method::PATCH);
        assert_eq!(update.url.as_str(), "https://app.example.com/api/task/task_5");
        assert_eq!(update.body["clientMutationId"], "mut_1");
    }

    #[test]
    fn test_route_segments_are_escaped() {
        let route = writer()
            .route(&request(
                Table::Task,
                MutationKind::Update,
                "a/b",
                json!({"name": "x"}),
            ))
            .unwrap();
        assert_eq!(route.url.as_str(), "https://app.example.com/api/task/a%2Fb");
    }

    #[test]
    fn test_read_receipt_route() {
        let route = writer()
            .route(&request(
                Table::Message,
                MutationKind::Update,
                "m1",
                json!({"readByUserIds": ["user_1"], "clientMutationId": "mut_1"}),
            ))
            .unwrap();

        assert_eq!(route.method, Method::POST);
        assert_eq!(route.url.as_str(), "https://app.example.com/api/message/read");
        assert_eq!(
            route.body,
            json!({"messageId": "m1", "clientMutationId": "mut_1"})
        );
    }

    #[test]
    fn test_message_edit_not_allowed() {
        let result = writer().route(&request(
            Table::Message,
            MutationKind::Update,
            "m1",
            json!({"content": "edited"}),
        ));
        assert!(matches!(result, Err(WriteError::Rejected { status: 405, .. })));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpEntityWriter::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let writer = HttpEntityWriter::new("http://127.0.0.1:9/").unwrap();
        let result = writer
            .write_entity(&request(
                Table::Task,
                MutationKind::Update,
                "task_5",
                json!({"statusId": "status_done"}),
            ))
            .await;
        assert!(matches!(result, Err(WriteError::Transport { .. })));
    }

    /// Serves one canned response and hands back the raw request text
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (Url, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            line.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .and_then(|value| value.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if received.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (url, server)
    }

    #[tokio::test]
    async fn test_sends_bearer_token_and_maps_rejection() {
        let (url, server) =
            one_shot_server("500 Internal Server Error", "Failed to update task").await;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap();
        let writer = HttpEntityWriter::new(url.as_str())
            .unwrap()
            .with_client(client)
            .with_bearer_token("secret");

        let result = writer
            .write_entity(&request(
                Table::Task,
                MutationKind::Update,
                "task_5",
                json!({"statusId": "status_done"}),
            ))
            .await;
        assert_eq!(
            result,
            Err(WriteError::Rejected {
                status: 500,
                message: "Failed to update task".to_string(),
            })
        );

        let received = server.await.unwrap();
        assert!(received.starts_with("PATCH /api/task/task_5 "));
        assert!(received.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(received.contains(r#"{"statusId":"status_done"}"#));
    }

    #[tokio::test]
    async fn test_success_acks_entity() {
        let (url, server) = one_shot_server("200 OK", "{}").await;
        let writer = HttpEntityWriter::new(url.as_str()).unwrap();

        let ack = writer
            .write_entity(&request(
                Table::Message,
                MutationKind::Create,
                "m1",
                json!({"content": "Hello team", "projectId": "proj_1"}),
            ))
            .await
            .unwrap();
        assert_eq!(ack.entity_id, "m1");

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /api/project/proj_1/message "));
        assert!(!received.to_ascii_lowercase().contains("authorization:"));
    }
}
