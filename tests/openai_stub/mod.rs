//! A local stand-in for the OpenAI Responses endpoint.

use std::io::Read as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum StubBehavior {
    /// Reply with as many words as the prompt's length directive asks for.
    FillLength,
    /// Reply with an API error for every request.
    Error,
}

pub struct OpenAiStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Value>>>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(behavior: StubBehavior) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind stub server");
        let base_url = format!("http://{}/v1", server.server_addr());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let requests = Arc::clone(&requests);
            let stop = Arc::clone(&stop);
            thread::spawn(move || serve(&server, behavior, &requests, &stop))
        };

        Self {
            base_url,
            requests,
            stop,
            worker: Some(worker),
        }
    }

    /// Request bodies received so far.
    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn serve(
    server: &tiny_http::Server,
    behavior: StubBehavior,
    requests: &Mutex<Vec<Value>>,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        let mut request = match server.recv_timeout(Duration::from_millis(25)) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(_) => return,
        };
        if request.url() != "/v1/responses" {
            reply(request, 404, json!({ "error": { "message": "unknown route" } }));
            continue;
        }

        let mut raw = String::new();
        let body = request
            .as_reader()
            .read_to_string(&mut raw)
            .ok()
            .and_then(|_| serde_json::from_str::<Value>(&raw).ok());
        let Some(body) = body else {
            reply(request, 400, json!({ "error": { "message": "bad request body" } }));
            continue;
        };
        if let Ok(mut seen) = requests.lock() {
            seen.push(body.clone());
        }

        match behavior {
            StubBehavior::Error => reply(
                request,
                429,
                json!({ "error": { "message": "quota exceeded", "type": "insufficient_quota" } }),
            ),
            StubBehavior::FillLength => {
                let prompt = body["input"].as_str().unwrap_or_default();
                let text = filler(requested_words(prompt).unwrap_or(50));
                reply(
                    request,
                    200,
                    json!({
                        "id": "resp_stub",
                        "object": "response",
                        "model": body["model"],
                        "output": [{
                            "type": "message",
                            "role": "assistant",
                            "content": [{ "type": "output_text", "text": text }]
                        }]
                    }),
                );
            }
        }
    }
}

fn reply(request: tiny_http::Request, status: u16, body: Value) {
    let content_type = "Content-Type: application/json"
        .parse::<tiny_http::Header>()
        .expect("content-type header");
    let response = tiny_http::Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(content_type);
    let _ = request.respond(response);
}

fn requested_words(prompt: &str) -> Option<usize> {
    let (_, rest) = prompt.split_once("Target length: approximately ")?;
    let digits = rest
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    digits.parse().ok()
}

/// Distinct words in paragraphs of 80.
fn filler(words: usize) -> String {
    (0..words)
        .map(|i| format!("w{i}"))
        .collect::<Vec<_>>()
        .chunks(80)
        .map(|chunk| chunk.join(" "))
        .collect::<Vec<_>>()
        .join("\n\n")
}
