#![forbid(unsafe_code)]

pub mod frames;

pub use frames::{
	AskRequest, AskResponse, ChatMessage, ClientFrame, DEFAULT_MAX_FRAME_SIZE, FrameError, InterruptRequest, PING, PONG,
	ResponseType, ReviewStateRequest, decode_client_frame, encode_response,
};
