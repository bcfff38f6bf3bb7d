//! Core crate for the facebatch face-swap batch server.

pub mod archive;
pub mod asset;
pub mod config;
pub mod dispatch;
pub mod image_ops;
pub mod inference;
pub mod logging;
pub mod progress;
pub mod server;

#[cfg(test)]
mod test_support;
