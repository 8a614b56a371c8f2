//! Byfs stream protocol
//!
//! Wire constants, the framing codec, request decoding, and transfer pacing.

pub mod codec;
pub mod codes;
pub mod pace;
pub mod request;

pub use codec::{ChunkError, WireReader, WireWriter};
pub use codes::{LockMode, Opcode, Whence};
pub use pace::TransferPace;
pub use request::Request;
