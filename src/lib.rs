pub mod automation;
pub mod config;
pub mod download;
pub mod metadata;
pub mod naming;
pub mod store;
pub mod transcode;

#[cfg(test)]
mod fixtures;
