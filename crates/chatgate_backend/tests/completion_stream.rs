use chatgate_backend::completion::ChatTurn;
use chatgate_backend::{BackendError, CompletionBackend, CompletionRequest, ConnectionParams, OpenAiCompletion, SecretString};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve one canned HTTP response and hand back the raw request head.
async fn serve_once(status_line: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("addr");

	let handle = tokio::spawn(async move {
		let (mut sock, _) = listener.accept().await.expect("accept");
		let mut buf = Vec::new();
		let mut chunk = [0u8; 4096];

		let head_end = loop {
			let n = sock.read(&mut chunk).await.expect("read");
			buf.extend_from_slice(&chunk[..n]);
			if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
				break pos + 4;
			}
		};

		let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
		let content_length = head
			.lines()
			.find_map(|l| {
				let (k, v) = l.split_once(':')?;
				k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
			})
			.unwrap_or(0);

		while buf.len() < head_end + content_length {
			let n = sock.read(&mut chunk).await.expect("read body");
			if n == 0 {
				break;
			}
			buf.extend_from_slice(&chunk[..n]);
		}

		let resp = format!(
			"{status_line}\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
			body.len()
		);
		sock.write_all(resp.as_bytes()).await.expect("write");
		sock.shutdown().await.ok();

		String::from_utf8_lossy(&buf).to_string()
	});

	(format!("http://{addr}/v1"), handle)
}

fn sse(deltas: &[&str]) -> String {
	let mut out = String::from("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n");
	for d in deltas {
		out.push_str(&format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{d}\"}}}}]}}\n\n"));
	}
	out.push_str("data: [DONE]\n\n");
	out
}

#[tokio::test]
async fn streams_deltas_until_done_marker() {
	let (base_url, server) = serve_once("HTTP/1.1 200 OK", sse(&["H", "e", "l", "lo"])).await;

	let params = ConnectionParams {
		api_key: SecretString::new("sk-test"),
		base_url,
		proxy: None,
	};
	let req = CompletionRequest {
		model: "gpt-test".to_string(),
		messages: vec![ChatTurn::system("be nice"), ChatTurn::user("Hello")],
	};

	let stream = OpenAiCompletion::new().stream_chat(&params, req).await.expect("open stream");
	let deltas: Vec<String> = stream.map(|d| d.expect("delta")).collect().await;
	assert_eq!(deltas, vec!["H", "e", "l", "lo"]);

	let raw = server.await.expect("server");
	assert!(raw.starts_with("POST /v1/chat/completions"));
	assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-test"));
	assert!(raw.contains("\"stream\":true"));
	assert!(raw.contains("\"role\":\"system\""));
}

#[tokio::test]
async fn non_success_status_is_reported() {
	let (base_url, server) = serve_once("HTTP/1.1 401 Unauthorized", "{\"error\":\"bad key\"}".to_string()).await;

	let params = ConnectionParams {
		api_key: SecretString::new("nope"),
		base_url,
		proxy: None,
	};
	let req = CompletionRequest {
		model: "gpt-test".to_string(),
		messages: vec![ChatTurn::user("hi")],
	};

	let err = match OpenAiCompletion::new().stream_chat(&params, req).await {
		Ok(_) => panic!("expected error"),
		Err(e) => e,
	};
	match err {
		BackendError::Status { status, body, .. } => {
			assert_eq!(status, 401);
			assert!(body.contains("bad key"));
		}
		other => panic!("unexpected error: {other:?}"),
	}
	server.await.expect("server");
}
