//! Core types shared by every layer: addresses, buffers, pipes, sessions.

pub mod address;
pub mod buffer;
pub mod log;
pub mod pipe;
pub mod session;

pub use address::{Address, Destination, Network};
pub use buffer::{Buffer, MultiBuffer, BUFFER_SIZE};
pub use pipe::{new_pipe, Link, LinkReader, LinkWriter, PipeError, PipeReader, PipeWriter};
pub use session::{Content, InboundMetadata, Session, SniffingRequest, User};
