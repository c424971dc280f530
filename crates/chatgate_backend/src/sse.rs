#![forbid(unsafe_code)]

//! `data:` payload extraction from a server-sent-events byte stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures::Stream;

/// Yields the payload of every `data:` line. Other fields are dropped.
pub(crate) struct SseDataStream<S> {
	inner: S,
	buffer: BytesMut,
	done: bool,
}

impl<S> SseDataStream<S> {
	pub(crate) fn new(inner: S) -> Self {
		Self {
			inner,
			buffer: BytesMut::new(),
			done: false,
		}
	}

	fn next_data_line(&mut self) -> Option<String> {
		while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
			let mut line = self.buffer.split_to(end + 1);
			line.truncate(end);
			if line.last() == Some(&b'\r') {
				line.truncate(end - 1);
			}

			if let Some(data) = parse_data_line(&String::from_utf8_lossy(&line)) {
				return Some(data);
			}
		}
		None
	}
}

fn parse_data_line(line: &str) -> Option<String> {
	let data = line.strip_prefix("data:")?;
	Some(data.strip_prefix(' ').unwrap_or(data).to_string())
}

impl<S, B, E> Stream for SseDataStream<S>
where
	S: Stream<Item = Result<B, E>> + Unpin,
	B: Buf,
{
	type Item = Result<String, E>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		loop {
			if let Some(data) = self.next_data_line() {
				return Poll::Ready(Some(Ok(data)));
			}

			if self.done {
				// Trailing line without newline.
				if self.buffer.is_empty() {
					return Poll::Ready(None);
				}
				let rest = self.buffer.split();
				return Poll::Ready(parse_data_line(&String::from_utf8_lossy(&rest)).map(Ok));
			}

			match Pin::new(&mut self.inner).poll_next(cx) {
				Poll::Ready(Some(Ok(mut chunk))) => {
					while chunk.has_remaining() {
						let part = chunk.chunk();
						let n = part.len();
						self.buffer.extend_from_slice(part);
						chunk.advance(n);
					}
				}
				Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
				Poll::Ready(None) => self.done = true,
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}
