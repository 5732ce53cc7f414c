//! GitHub Actions implementation of the registration service client

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod error;

pub use client::GitHubClient;
pub use config::GitHubConfig;
pub use error::GitHubError;
