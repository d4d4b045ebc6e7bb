use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Local HTTP/1 server answering every request through `handler(path_and_query)`.
pub(crate) struct MockServer {
  pub base_url: String,
  pub hits: Arc<AtomicUsize>,
  pub requests: Arc<Mutex<Vec<String>>>,
  task: JoinHandle<()>,
}

impl MockServer {
  pub fn hit_count(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }

  pub fn requested(&self) -> Vec<String> {
    self.requests.lock().unwrap().clone()
  }
}

impl Drop for MockServer {
  fn drop(&mut self) {
    self.task.abort();
  }
}

pub(crate) async fn spawn_mock<F>(handler: F) -> MockServer
where
  F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
  spawn_mock_with_headers(move |pq: &str| {
    let (status, body) = handler(pq);
    (status, Vec::new(), body)
  })
  .await
}

/// Like `spawn_mock`, with extra response headers per reply.
pub(crate) async fn spawn_mock_with_headers<F>(handler: F) -> MockServer
where
  F: Fn(&str) -> (u16, Vec<(&'static str, String)>, String) + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handler = Arc::new(handler);
  let hits = Arc::new(AtomicUsize::new(0));
  let requests = Arc::new(Mutex::new(Vec::new()));

  let task = tokio::spawn({
    let hits = hits.clone();
    let requests = requests.clone();
    async move {
      loop {
        let Ok((stream, _)) = listener.accept().await else {
          break;
        };
        let handler = handler.clone();
        let hits = hits.clone();
        let requests = requests.clone();
        tokio::spawn(async move {
          let io = TokioIo::new(stream);
          let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let hits = hits.clone();
            let requests = requests.clone();
            async move {
              hits.fetch_add(1, Ordering::SeqCst);
              let path_and_query = req
                .uri()
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default();
              requests.lock().unwrap().push(path_and_query.clone());
              let (status, headers, body) = handler(&path_and_query);
              let mut builder = Response::builder()
                .status(status)
                .header("content-type", "application/json");
              for (name, value) in headers {
                builder = builder.header(name, value);
              }
              Ok::<_, hyper::Error>(builder.body(Full::new(Bytes::from(body))).unwrap())
            }
          });
          let _ = http1::Builder::new().serve_connection(io, service).await;
        });
      }
    }
  });

  MockServer {
    base_url: format!("http://{}/", addr),
    hits,
    requests,
    task,
  }
}

pub(crate) fn query_param<'a>(path_and_query: &'a str, key: &str) -> Option<&'a str> {
  let (_, query) = path_and_query.split_once('?')?;
  query
    .split('&')
    .filter_map(|part| part.split_once('='))
    .find(|(k, _)| *k == key)
    .map(|(_, v)| v)
}
