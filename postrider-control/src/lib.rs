pub mod client;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use framing::{MAX_FRAME_BYTES, read_frame, write_frame};
pub use protocol::{Command, Reply};
pub use server::{CommandHandler, ControlServer};
