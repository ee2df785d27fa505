pub mod error;
pub mod openai;
pub mod sse;
pub mod toolcall;
pub mod translate;
pub mod upstream;

pub use error::{RelayError, Result};
pub use upstream::UpstreamClient;
