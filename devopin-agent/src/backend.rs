use std::time::Duration;

use bytes::Bytes;
use devopin_proto::{
    MonitoringPayload,
    msg::{Envelope, ProjectRecord, WorkerRecord},
};
use http::{Method, Uri, header};
use log::{debug, trace};
use serde::de::DeserializeOwned;

use crate::http_util::{self, NetworkError};

const PROJECTS_PATH: &str = "/api/projects";
const WORKERS_PATH: &str = "/api/workers";
const MONITORING_DATA_PATH: &str = "/api/monitoring-data";

/// Client of the backend HTTP API. Every call is bounded by the request timeout.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    timeout: Duration,
    prefer_ipv6: bool,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration, prefer_ipv6: bool) -> Result<Self, NetworkError> {
        let client = BackendClient {
            base_url: base_url.trim_end_matches('/').to_owned(),
            timeout,
            prefer_ipv6,
        };
        // reject unusable URLs at startup rather than every cycle
        http_util::request_builder(&client.uri(PROJECTS_PATH)?, Method::GET)?;
        Ok(client)
    }

    fn uri(&self, path: &str) -> Result<Uri, NetworkError> {
        let url = format!("{}{path}", self.base_url);
        url.parse().map_err(|e: http::uri::InvalidUri| NetworkError::InvalidUrl {
            url,
            reason: e.to_string(),
        })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Bytes>) -> Result<Bytes, NetworkError> {
        let uri = self.uri(path)?;
        let mut builder = http_util::request_builder(&uri, method)?
            .header(header::ACCEPT, "application/json");
        let body = match body {
            Some(body) => {
                builder = builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::CONTENT_LENGTH, body.len());
                body
            }
            None => Bytes::new(),
        };
        let req = builder.body(body)?;

        let resp = tokio::time::timeout(self.timeout, http_util::send_http_request(req, self.prefer_ipv6))
            .await
            .map_err(|_| NetworkError::Timeout(self.timeout))??;
        if !resp.status().is_success() {
            return Err(NetworkError::Status {
                status: resp.status().as_u16(),
                body: String::from_utf8_lossy(resp.body()).chars().take(512).collect(),
            });
        }
        Ok(resp.into_body())
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, NetworkError> {
        let body = self.call(Method::GET, path, None).await?;
        trace!("{path}: {}", String::from_utf8_lossy(&body));
        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        Ok(envelope.into_items())
    }

    pub async fn fetch_projects(&self) -> Result<Vec<ProjectRecord>, NetworkError> {
        self.list(PROJECTS_PATH).await
    }

    pub async fn fetch_workers(&self) -> Result<Vec<WorkerRecord>, NetworkError> {
        self.list(WORKERS_PATH).await
    }

    pub async fn upload(&self, payload: &MonitoringPayload) -> Result<(), NetworkError> {
        let body = Bytes::from(serde_json::to_vec(payload)?);
        let size = body.len();
        self.call(Method::POST, MONITORING_DATA_PATH, Some(body)).await?;
        debug!("uploaded monitoring payload ({size} bytes)");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, Mutex};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// Minimal HTTP backend answering by path; records every request body by path.
    pub(crate) struct FakeBackend {
        pub url: String,
        pub received: Arc<Mutex<Vec<(String, String)>>>,
        pub task: tokio::task::JoinHandle<()>,
    }

    impl FakeBackend {
        pub async fn start(routes: Vec<(&'static str, u16, &'static str)>) -> Self {
            Self::start_with_delay(routes, Duration::ZERO).await
        }

        pub async fn start_with_delay(
            routes: Vec<(&'static str, u16, &'static str)>,
            delay: Duration,
        ) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
            let received = Arc::new(Mutex::new(Vec::new()));
            let task = tokio::spawn({
                let received = received.clone();
                async move {
                    loop {
                        let Ok((mut socket, _)) = listener.accept().await else {
                            return;
                        };
                        let routes = routes.clone();
                        let received = received.clone();
                        tokio::spawn(async move {
                            let Some((path, body)) = read_request(&mut socket).await else {
                                return;
                            };
                            received.lock().unwrap().push((path.clone(), body));
                            tokio::time::sleep(delay).await;
                            let (status, reply) = routes
                                .iter()
                                .find(|(p, _, _)| *p == path)
                                .map(|(_, s, r)| (*s, *r))
                                .unwrap_or((404, "{}"));
                            let resp = format!(
                                "HTTP/1.1 {status} X\r\nContent-Length: {}\r\n\r\n{reply}",
                                reply.len()
                            );
                            let _ = socket.write_all(resp.as_bytes()).await;
                        });
                    }
                }
            });
            FakeBackend {
                url,
                received,
                task,
            }
        }

        pub fn bodies(&self, path: &str) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p == path)
                .map(|(_, b)| b.clone())
                .collect()
        }
    }

    impl Drop for FakeBackend {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<(String, String)> {
        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 4096];
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut req = httparse::Request::new(&mut headers);
            if let httparse::Status::Complete(head) = req.parse(&buf).ok()? {
                let length = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok()?.parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= head + length {
                    let path = req.path?.to_owned();
                    let body = String::from_utf8_lossy(&buf[head..head + length]).into_owned();
                    return Some((path, body));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_lists() {
        let backend = FakeBackend::start(vec![
            (
                PROJECTS_PATH,
                200,
                r#"{"data":[{"name":"shop","log_path":"shop/laravel.log","framework_type":"laravel"}]}"#,
            ),
            (WORKERS_PATH, 200, r#"{"data":["queue-worker",{"name":"cron"}]}"#),
        ])
        .await;
        let client = BackendClient::new(&backend.url, Duration::from_secs(2), false).unwrap();

        let projects = client.fetch_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].framework_type.as_deref(), Some("laravel"));

        let workers = client.fetch_workers().await.unwrap();
        let names: Vec<_> = workers.iter().map(|w| w.name()).collect();
        assert_eq!(names, ["queue-worker", "cron"]);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let backend = FakeBackend::start(vec![(PROJECTS_PATH, 500, r#"{"error":"db down"}"#)]).await;
        let client = BackendClient::new(&backend.url, Duration::from_secs(2), false).unwrap();
        match client.fetch_projects().await {
            Err(NetworkError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert!(body.contains("db down"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let backend = FakeBackend::start_with_delay(
            vec![(WORKERS_PATH, 200, r#"{"data":[]}"#)],
            Duration::from_secs(5),
        )
        .await;
        let client = BackendClient::new(&backend.url, Duration::from_millis(200), false).unwrap();
        assert!(matches!(
            client.fetch_workers().await,
            Err(NetworkError::Timeout(_))
        ));
    }
}
