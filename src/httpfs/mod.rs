//! The application on top of the transport: a directory-backed file server
//! and the request builder its clients use.

pub mod file_server;
pub mod request;
