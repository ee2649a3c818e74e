pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

pub use error::{RelayError, Result};
pub use media::{MediaDescription, MediaKind, RtpPacket, Track};
pub use registry::{PublisherHandle, StreamRegistry};
pub use server::{Server, ServerConfig};
pub use session::SessionId;
pub use stream::Stream;
