//! The request path (§4.2-§4.4): frame/reassemble on the connection, decode
//! arguments, dispatch to a command handler, write the response.

pub mod args;
pub mod core;
pub mod dispatch;
pub mod fsm;
pub mod registry;
pub mod response;

pub use self::core::{serve, CoreHandle};
