// A SIP stack with dialog usages and a conversation bridge manager
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod conversation;
pub mod dialog;
pub mod endpoint;
pub mod error;
pub mod rsip_ext;
pub mod sdp;
pub mod security;
pub mod transaction;
pub mod transport;
pub use endpoint::{Endpoint, EndpointBuilder};
