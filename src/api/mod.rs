//! HTTP access to the controller fleet.
//!
//! [`HostGateway`] serializes and retries every request per host;
//! [`DocumentClient`] layers typed document and endpoint operations on
//! top of it.

mod client;
mod error;
mod gateway;

pub use client::DocumentClient;
pub use error::ApiError;
pub use gateway::{GatewayPolicy, HostGateway, RequestOptions};
