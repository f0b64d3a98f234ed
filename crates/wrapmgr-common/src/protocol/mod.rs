pub mod error;
pub mod messages;
pub mod requests;
pub mod responses;


pub use error::{Result, WrapmgrError};
pub use messages::*;
pub use requests::{Method, Request, RequestId, RpcArgs};
pub use responses::{Reply, ReplyHeader, Response};
