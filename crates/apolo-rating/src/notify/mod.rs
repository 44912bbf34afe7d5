//! Outbound notifiers used by the action runtime
//!
//! - [`HttpPoster`] - JSON posts with retries and a spool directory
//! - [`Mailer`] - mail delivery, logged by default
//! - [`RpcClient`] - JSON requests over TCP

pub mod http;
pub mod mail;
pub mod rpc;

pub use http::{spool_file_name, HttpPoster};
pub use mail::{LogMailer, MailMessage, Mailer};
pub use rpc::{JsonTcpRpcClient, RpcClient, RpcRequest};
