use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use url::Url;

/// One request as seen by the mock robot endpoint.
#[derive(Debug, Clone)]
pub struct Received {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Received {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("robot body should be JSON")
    }

    pub fn content(&self) -> String {
        self.json()["text"]["content"]
            .as_str()
            .expect("text.content should be a string")
            .to_owned()
    }
}

#[derive(Default)]
struct State {
    received: Vec<Received>,
    /// Statuses to answer with, in order; 200 once exhausted.
    statuses: VecDeque<StatusCode>,
}

/// Stand-in for the DingTalk `/robot/send` endpoint on a random local port.
#[derive(Clone)]
pub struct MockRobot {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl MockRobot {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock robot listener");
        let addr = listener.local_addr().unwrap();
        let state: Arc<Mutex<State>> = Arc::default();
        let server_state = Arc::clone(&state);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&server_state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    /// Base URL in the shape the sink expects: the token is appended directly.
    pub fn base_url(&self) -> String {
        format!("http://{}/robot/send?access_token=", self.addr)
    }

    /// Queue response statuses for the next requests.
    pub fn respond_with(&self, statuses: &[StatusCode]) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .extend(statuses.iter().copied());
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.lock().unwrap().received.clone()
    }

    /// Poll until at least `n` requests arrived or `timeout` passes.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Received> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received();
            if received.len() >= n || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn handle<B>(
    req: Request<B>,
    state: Arc<Mutex<State>>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();
    let query = req
        .uri()
        .query()
        .map(|q| {
            Url::parse(&format!("http://robot/?{q}"))
                .map(|u| u.query_pairs().into_owned().collect())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned());

    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let status = {
        let mut state = state.lock().unwrap();
        state.received.push(Received {
            method,
            path,
            query,
            content_type,
            body,
        });
        state.statuses.pop_front().unwrap_or(StatusCode::OK)
    };

    Ok(Response::builder()
        .status(status)
        .body(Full::from(r#"{"errcode":0,"errmsg":"ok"}"#))
        .unwrap())
}
