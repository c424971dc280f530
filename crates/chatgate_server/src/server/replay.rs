#![forbid(unsafe_code)]

//! Per-session transcript file in asciinema v2 (`.cast`) format.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::warn;

use crate::util::time::{local_stamp, unix_secs_now};

/// Terminal geometry written to the header; output rows wrap at this width.
pub const REPLAY_WIDTH: usize = 100;
pub const REPLAY_HEIGHT: usize = 40;

enum ReplayCommand {
	Row(String),
	Flush(oneshot::Sender<anyhow::Result<()>>),
	Finish(oneshot::Sender<anyhow::Result<PathBuf>>),
}

/// Handle to a session's single transcript writer task.
#[derive(Clone)]
pub struct ReplayRecorder {
	session_id: Arc<str>,
	path: PathBuf,
	tx: mpsc::UnboundedSender<ReplayCommand>,
}

impl ReplayRecorder {
	/// Spawn the writer for `<dir>/<session_id>.cast`. The file is created lazily.
	pub fn spawn(dir: &Path, session_id: &str) -> Self {
		let path = dir.join(format!("{session_id}.cast"));
		let (tx, rx) = mpsc::unbounded_channel();

		let writer = ReplayWriter {
			session_id: session_id.to_string(),
			path: path.clone(),
			file: None,
			started: Instant::now(),
			closed: false,
		};
		tokio::spawn(writer.run(rx));

		Self {
			session_id: Arc::from(session_id),
			path,
			tx,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn write_input(&self, input: &str) {
		self.enqueue(format_row(&format!("[{}]#: {input}", local_stamp())));
	}

	pub fn write_output(&self, output: &str) {
		let wrapped = wrap_text(output, REPLAY_WIDTH);
		self.enqueue(format_row(&format!("\r\n {wrapped} \r\n")));
	}

	fn enqueue(&self, row: String) {
		if self.tx.send(ReplayCommand::Row(row)).is_err() {
			metrics::counter!("chatgate_server_background_failures_total", "kind" => "transcript").increment(1);
			warn!(session_id = %self.session_id, "transcript writer gone; row dropped");
		}
	}

	/// Wait until every queued row is on disk.
	pub async fn flush(&self) -> anyhow::Result<()> {
		let (tx, rx) = oneshot::channel();
		self.tx
			.send(ReplayCommand::Flush(tx))
			.map_err(|_| anyhow!("transcript writer gone"))?;
		rx.await.context("transcript writer dropped flush")?
	}

	/// Flush, close the file and return its path. Later rows are ignored.
	pub async fn finish(&self) -> anyhow::Result<PathBuf> {
		let (tx, rx) = oneshot::channel();
		self.tx
			.send(ReplayCommand::Finish(tx))
			.map_err(|_| anyhow!("transcript writer gone"))?;
		rx.await.context("transcript writer dropped finish")?
	}
}

/// Newlines become CRLF and the row gets a trailing ` \r\n`.
fn format_row(row: &str) -> String {
	let row = row.replace('\n', "\r\n").replace("\r\r\n", "\r\n");
	format!("{row} \r\n")
}

/// Greedy word wrap; whitespace runs collapse to one space.
fn wrap_text(text: &str, width: usize) -> String {
	let mut lines: Vec<String> = Vec::new();
	let mut line = String::new();
	let mut line_len = 0usize;

	for word in text.split_whitespace() {
		let mut word = word;
		let mut word_len = word.chars().count();

		if line_len > 0 && line_len + 1 + word_len > width {
			lines.push(std::mem::take(&mut line));
			line_len = 0;
		}

		while word_len > width {
			let split = word.char_indices().nth(width).map(|(i, _)| i).unwrap_or(word.len());
			if line_len > 0 {
				lines.push(std::mem::take(&mut line));
				line_len = 0;
			}
			lines.push(word[..split].to_string());
			word = &word[split..];
			word_len = word.chars().count();
		}

		if word.is_empty() {
			continue;
		}
		if line_len > 0 {
			line.push(' ');
			line_len += 1;
		}
		line.push_str(word);
		line_len += word_len;
	}

	if !line.is_empty() {
		lines.push(line);
	}
	lines.join("\n")
}

struct ReplayWriter {
	session_id: String,
	path: PathBuf,
	file: Option<BufWriter<File>>,
	started: Instant,
	closed: bool,
}

impl ReplayWriter {
	async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ReplayCommand>) {
		while let Some(cmd) = rx.recv().await {
			match cmd {
				ReplayCommand::Row(row) => {
					if self.closed {
						continue;
					}
					if let Err(e) = self.write_row(&row).await {
						metrics::counter!("chatgate_server_background_failures_total", "kind" => "transcript").increment(1);
						warn!(session_id = %self.session_id, error = %e, "failed to write transcript row");
					}
				}
				ReplayCommand::Flush(reply) => {
					let _ = reply.send(self.flush().await);
				}
				ReplayCommand::Finish(reply) => {
					let result = self.close().await.map(|_| self.path.clone());
					let _ = reply.send(result);
				}
			}
		}

		if let Err(e) = self.close().await {
			warn!(session_id = %self.session_id, error = %e, "failed to close transcript");
		}
	}

	async fn open(&mut self) -> anyhow::Result<&mut BufWriter<File>> {
		if self.file.is_none() {
			if let Some(dir) = self.path.parent() {
				fs::create_dir_all(dir)
					.await
					.with_context(|| format!("create replay dir {}", dir.display()))?;
			}

			let exists = fs::try_exists(&self.path).await.unwrap_or(false);
			let file = fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(&self.path)
				.await
				.with_context(|| format!("open replay file {}", self.path.display()))?;
			let mut file = BufWriter::new(file);

			if !exists {
				let header = serde_json::json!({
					"version": 2,
					"width": REPLAY_WIDTH,
					"height": REPLAY_HEIGHT,
					"timestamp": unix_secs_now(),
					"title": self.session_id,
					"env": { "SHELL": "/bin/bash", "TERM": "xterm" },
				});
				file.write_all(format!("{header}\n").as_bytes()).await?;
			}
			self.file = Some(file);
		}

		self.file.as_mut().ok_or_else(|| anyhow!("replay file unavailable"))
	}

	async fn write_row(&mut self, row: &str) -> anyhow::Result<()> {
		let elapsed = self.started.elapsed().as_secs_f64();
		let line = serde_json::to_string(&(elapsed, "o", row))?;
		let file = self.open().await?;
		file.write_all(line.as_bytes()).await?;
		file.write_all(b"\n").await?;
		Ok(())
	}

	async fn flush(&mut self) -> anyhow::Result<()> {
		if let Some(file) = self.file.as_mut() {
			file.flush().await.context("flush replay file")?;
		}
		Ok(())
	}

	async fn close(&mut self) -> anyhow::Result<()> {
		if self.closed {
			return Ok(());
		}
		// An empty session still uploads a file with a header.
		self.open().await?;
		self.flush().await?;
		self.file = None;
		self.closed = true;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_dir() -> PathBuf {
		std::env::temp_dir().join(format!("chatgate-replay-{}", uuid::Uuid::new_v4()))
	}

	#[test]
	fn rows_use_crlf_and_trailing_space() {
		assert_eq!(format_row("a\nb"), "a\r\nb \r\n");
		assert_eq!(format_row("a\r\nb"), "a\r\nb \r\n");
	}

	#[test]
	fn wrap_breaks_long_lines() {
		assert_eq!(wrap_text("aaa bbb ccc", 7), "aaa bbb\nccc");
		assert_eq!(wrap_text("abcdefghij", 4), "abcd\nefgh\nij");
		assert_eq!(wrap_text("  spaced \n out  ", 80), "spaced out");
	}

	#[tokio::test]
	async fn writes_header_then_rows_in_order() {
		let dir = temp_dir();
		let rec = ReplayRecorder::spawn(&dir, "s1");
		rec.write_input("hello");
		rec.write_output("world");

		let path = rec.finish().await.expect("finish");
		assert_eq!(path, dir.join("s1.cast"));

		let text = tokio::fs::read_to_string(&path).await.expect("read");
		let lines: Vec<&str> = text.lines().collect();
		assert_eq!(lines.len(), 3);

		let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
		assert_eq!(header["version"], 2);
		assert_eq!(header["title"], "s1");

		let input: (f64, String, String) = serde_json::from_str(lines[1]).unwrap();
		assert_eq!(input.1, "o");
		assert!(input.2.contains("]#: hello"));

		let output: (f64, String, String) = serde_json::from_str(lines[2]).unwrap();
		assert_eq!(output.2, "\r\n world \r\n \r\n");

		rec.write_input("ignored after finish");
		rec.flush().await.expect("flush");
		let again = tokio::fs::read_to_string(&path).await.expect("read");
		assert_eq!(again.lines().count(), 3);

		let _ = tokio::fs::remove_dir_all(&dir).await;
	}

	#[tokio::test]
	async fn finish_without_rows_still_creates_file() {
		let dir = temp_dir();
		let rec = ReplayRecorder::spawn(&dir, "empty");
		let path = rec.finish().await.expect("finish");
		let text = tokio::fs::read_to_string(&path).await.expect("read");
		assert_eq!(text.lines().count(), 1);
		let _ = tokio::fs::remove_dir_all(&dir).await;
	}
}
