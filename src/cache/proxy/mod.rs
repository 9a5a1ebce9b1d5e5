//! External store client

mod client;

pub use client::RedisProxyClient;
