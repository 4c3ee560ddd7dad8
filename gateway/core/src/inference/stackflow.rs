//! StackFlow inference client
//!
//! Blocking client for inference services that exchange one JSON object per
//! line over a TCP socket. A session is opened by `setup`, which returns the
//! `work_id` used by every later request. Inference answers arrive as a run
//! of `{"data": {"delta": .., "finish": ..}}` lines ending with `finish: true`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{InferenceClient, InferenceError, SetupOptions, TokenIter};

/// Default timeout for establishing the TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open socket plus the work id assigned at setup
struct Session {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    work_id: String,
    /// An answer was started and not read up to its `finish: true` line
    pending: bool,
}

impl Session {
    fn send(&mut self, request: &Value) -> Result<(), InferenceError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|e| InferenceError::Protocol(format!("encode request: {e}")))?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Value, InferenceError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Err(InferenceError::Protocol(
                "connection closed by inference service".to_string(),
            ));
        }
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| InferenceError::Protocol(format!("invalid response line: {e}")))?;
        check_error(&value)?;
        Ok(value)
    }

    /// Read and discard the rest of an abandoned answer
    fn drain_pending(&mut self) -> Result<(), InferenceError> {
        let mut discarded = 0usize;
        while self.pending {
            match self.recv() {
                Ok(reply) => {
                    if is_finish(&reply) {
                        self.pending = false;
                    } else {
                        discarded += 1;
                    }
                }
                Err(InferenceError::Remote { .. }) => self.pending = false,
                Err(e) => return Err(e),
            }
        }
        if discarded > 0 {
            debug!(work_id = %self.work_id, discarded, "Discarded unread answer lines");
        }
        Ok(())
    }
}

fn is_finish(reply: &Value) -> bool {
    reply
        .pointer("/data/finish")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Map a non-zero `error.code` in a response to [`InferenceError::Remote`]
fn check_error(value: &Value) -> Result<(), InferenceError> {
    let Some(error) = value.get("error") else {
        return Ok(());
    };
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(InferenceError::Remote { code, message })
}

fn request_id(action: &str) -> String {
    format!("{action}-{}", uuid::Uuid::new_v4().simple())
}

/// Blocking StackFlow client
pub struct StackFlowClient {
    host: String,
    port: u16,
    connect_timeout: Duration,
    session: Option<Arc<Mutex<Session>>>,
}

impl StackFlowClient {
    /// Create an unconnected client. No I/O happens until `setup`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: CONNECT_TIMEOUT,
            session: None,
        }
    }

    /// Override the connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Target address as `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether `setup` has completed on this client
    #[must_use]
    pub fn is_set_up(&self) -> bool {
        self.session.is_some()
    }

    fn connect(&self) -> Result<TcpStream, InferenceError> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.map_or_else(
            || InferenceError::Protocol(format!("no address for {}", self.address())),
            InferenceError::Io,
        ))
    }
}

impl InferenceClient for StackFlowClient {
    fn setup(&mut self, options: &SetupOptions) -> Result<(), InferenceError> {
        let stream = self.connect()?;
        let reader = BufReader::new(stream.try_clone()?);
        let mut session = Session {
            writer: stream,
            reader,
            work_id: "llm".to_string(),
            pending: false,
        };

        session.send(&json!({
            "request_id": request_id("setup"),
            "work_id": "llm",
            "action": "setup",
            "object": "llm.setup",
            "data": {
                "model": options.model,
                "response_format": options.response_format,
                "input": options.input_format,
                "enoutput": options.echo_suppressed,
                "max_token_len": options.max_output_len,
                "temperature": options.temperature,
                "prompt": options.system_prompt,
            }
        }))?;

        let reply = session.recv()?;
        let work_id = reply
            .get("work_id")
            .and_then(Value::as_str)
            .filter(|w| !w.is_empty())
            .ok_or_else(|| InferenceError::Protocol("setup reply has no work_id".to_string()))?;
        session.work_id = work_id.to_string();

        debug!(address = %self.address(), work_id = %session.work_id, "Inference session set up");
        self.session = Some(Arc::new(Mutex::new(session)));
        Ok(())
    }

    fn inference_stream(&mut self, query: &str) -> Result<TokenIter, InferenceError> {
        let session = self.session.clone().ok_or(InferenceError::NotSetUp)?;
        {
            let mut guard = session.lock();
            guard.drain_pending()?;
            let request = json!({
                "request_id": request_id("inference"),
                "work_id": guard.work_id,
                "action": "inference",
                "object": "llm.utf-8.stream",
                "data": {
                    "delta": query,
                    "index": 0,
                    "finish": true,
                }
            });
            guard.send(&request)?;
            guard.pending = true;
        }
        Ok(Box::new(StackFlowTokens {
            session,
            finished: false,
        }))
    }
}

impl Drop for StackFlowClient {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let mut guard = session.lock();
        let request = json!({
            "request_id": request_id("exit"),
            "work_id": guard.work_id,
            "action": "exit",
        });
        if let Err(e) = guard.send(&request) {
            warn!(address = %self.address(), error = %e, "Failed to close inference session");
        }
    }
}

/// Fragments of one inference answer
struct StackFlowTokens {
    session: Arc<Mutex<Session>>,
    finished: bool,
}

impl Iterator for StackFlowTokens {
    type Item = Result<String, InferenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let mut session = self.session.lock();
            let reply = match session.recv() {
                Ok(reply) => reply,
                Err(e) => {
                    // a remote error ends the answer; anything else leaves it unread
                    if matches!(e, InferenceError::Remote { .. }) {
                        session.pending = false;
                    }
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            drop(session);

            let Some(data) = reply.get("data").filter(|d| d.is_object()) else {
                // status lines without a payload
                continue;
            };
            self.finished = is_finish(&reply);
            if self.finished {
                self.session.lock().pending = false;
            }
            let delta = data
                .get("delta")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !delta.is_empty() {
                return Some(Ok(delta.to_string()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn options() -> SetupOptions {
        SetupOptions {
            model: "qwen-test".to_string(),
            response_format: super::super::DEFAULT_RESPONSE_FORMAT.to_string(),
            input_format: super::super::DEFAULT_INPUT_FORMAT.to_string(),
            echo_suppressed: true,
            max_output_len: 128,
            temperature: 0.5,
            system_prompt: "be brief".to_string(),
        }
    }

    /// Fake service: answers setup, then streams `deltas` for one inference.
    /// Returns the requests it received.
    fn spawn_fake_service(deltas: Vec<&'static str>) -> (u16, thread::JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut seen = Vec::new();

            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                let request: Value = serde_json::from_str(line.trim()).unwrap();
                line.clear();
                let action = request["action"].as_str().unwrap_or_default().to_string();
                seen.push(request);

                match action.as_str() {
                    "setup" => {
                        let reply = json!({"work_id": "llm.1001", "error": {"code": 0, "message": ""}});
                        writeln!(writer, "{reply}").unwrap();
                    }
                    "inference" => {
                        for (i, delta) in deltas.iter().enumerate() {
                            let reply = json!({
                                "work_id": "llm.1001",
                                "data": {"delta": delta, "index": i, "finish": false},
                                "error": {"code": 0, "message": ""}
                            });
                            writeln!(writer, "{reply}").unwrap();
                        }
                        let done = json!({
                            "work_id": "llm.1001",
                            "data": {"delta": "", "index": deltas.len(), "finish": true}
                        });
                        writeln!(writer, "{done}").unwrap();
                    }
                    _ => break,
                }
            }
            seen
        });

        (port, handle)
    }

    #[test]
    fn test_setup_and_stream_round() {
        let (port, server) = spawn_fake_service(vec!["Hel", "lo", "!"]);

        let mut client = StackFlowClient::new("127.0.0.1", port);
        assert!(!client.is_set_up());
        client.setup(&options()).unwrap();
        assert!(client.is_set_up());

        let tokens: Vec<String> = client
            .inference_stream("user: hi")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tokens, vec!["Hel", "lo", "!"]);

        drop(client);
        let seen = server.join().unwrap();

        assert_eq!(seen[0]["action"], "setup");
        assert_eq!(seen[0]["data"]["model"], "qwen-test");
        assert_eq!(seen[0]["data"]["prompt"], "be brief");
        assert_eq!(seen[0]["data"]["max_token_len"], 128);
        assert_eq!(seen[1]["action"], "inference");
        assert_eq!(seen[1]["work_id"], "llm.1001");
        assert_eq!(seen[1]["data"]["delta"], "user: hi");
        assert_eq!(seen[2]["action"], "exit");
    }

    #[test]
    fn test_stream_before_setup_fails() {
        let mut client = StackFlowClient::new("127.0.0.1", 1);
        assert!(matches!(
            client.inference_stream("q"),
            Err(InferenceError::NotSetUp)
        ));
    }

    #[test]
    fn test_remote_error_code() {
        let value = json!({"error": {"code": -4, "message": "model busy"}});
        match check_error(&value) {
            Err(InferenceError::Remote { code, message }) => {
                assert_eq!(code, -4);
                assert_eq!(message, "model busy");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        assert!(check_error(&json!({"error": {"code": 0}})).is_ok());
        assert!(check_error(&json!({"data": {}})).is_ok());
    }

    #[test]
    fn test_connection_closed_mid_answer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            writeln!(writer, "{}", json!({"work_id": "llm.7"})).unwrap();
            line.clear();
            reader.read_line(&mut line).unwrap();
            writeln!(writer, "{}", json!({"data": {"delta": "par", "finish": false}})).unwrap();
            // socket closes here
        });

        let mut client = StackFlowClient::new("127.0.0.1", port);
        client.setup(&options()).unwrap();
        let mut tokens = client.inference_stream("q").unwrap();

        assert_eq!(tokens.next().unwrap().unwrap(), "par");
        server.join().unwrap();
        assert!(matches!(tokens.next(), Some(Err(InferenceError::Protocol(_)))));
        assert!(tokens.next().is_none());
    }

    /// Fake service that answers every query `q` with `q-0|`, `q-1|`, `q-2|`
    fn spawn_query_echo_service() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let request: Value = serde_json::from_str(line.trim()).unwrap();
                line.clear();
                match request["action"].as_str() {
                    Some("setup") => {
                        writeln!(writer, "{}", json!({"work_id": "llm.2002"})).unwrap();
                    }
                    Some("inference") => {
                        let query = request["data"]["delta"].as_str().unwrap_or_default();
                        for i in 0..3 {
                            let delta = format!("{query}-{i}|");
                            let reply = json!({"data": {"delta": delta, "finish": false}});
                            writeln!(writer, "{reply}").unwrap();
                        }
                        writeln!(writer, "{}", json!({"data": {"delta": "", "finish": true}}))
                            .unwrap();
                    }
                    _ => break,
                }
            }
        });

        port
    }

    #[test]
    fn test_abandoned_answer_does_not_leak_into_next() {
        let port = spawn_query_echo_service();
        let mut client = StackFlowClient::new("127.0.0.1", port);
        client.setup(&options()).unwrap();

        let mut first = client.inference_stream("A").unwrap();
        assert_eq!(first.next().unwrap().unwrap(), "A-0|");
        drop(first);

        let second: String = client
            .inference_stream("B")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(second, "B-0|B-1|B-2|");

        // an answer read to the end leaves nothing to discard
        let third: String = client
            .inference_stream("C")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(third, "C-0|C-1|C-2|");
    }

    #[test]
    fn test_abandoned_answer_on_dead_socket_fails_next_query() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            writeln!(writer, "{}", json!({"work_id": "llm.8"})).unwrap();
            line.clear();
            reader.read_line(&mut line).unwrap();
            writeln!(writer, "{}", json!({"data": {"delta": "par", "finish": false}})).unwrap();
        });

        let mut client = StackFlowClient::new("127.0.0.1", port);
        client.setup(&options()).unwrap();
        let mut tokens = client.inference_stream("q").unwrap();
        assert_eq!(tokens.next().unwrap().unwrap(), "par");
        drop(tokens);
        server.join().unwrap();

        assert!(matches!(
            client.inference_stream("next"),
            Err(InferenceError::Protocol(_))
        ));
    }
}
