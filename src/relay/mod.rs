pub mod addressing;
pub mod context;
mod dispatch;
pub mod errors;
pub mod handler;
pub mod hops;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod streaming;
pub mod types;

pub use addressing::{DeliveryMode, Route};
pub use context::{CallContext, Trace};
pub use errors::{BusinessError, RelayError};
pub use handler::{Handler, HandlerStream, Request};
pub use hops::Hop;
pub use pipeline::{Exchange, RequestView, ResponseHandle, Stage};
pub use registry::RegistrationId;
pub use relay::{ErrorHandler, Relay};
pub use streaming::ReplyStream;
pub use types::{Reply, RequestMessage, ResponseMessage};
