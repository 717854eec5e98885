//! AWS SDK S3 backend for stowage.
//!
//! This crate provides a `StorageClient` implementation using the AWS SDK for Rust.
//! It works against AWS S3 and S3-compatible stores reached through a custom endpoint.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stowage_storage_crt::{ClientSettings, CrtStorageClient};
//! use stowage_storage::{OrchestratorSettings, TransferOrchestrator, TransferRequest};
//!
//! let client = CrtStorageClient::new(ClientSettings::default()).await?;
//! let orchestrator = TransferOrchestrator::new(Arc::new(client), OrchestratorSettings::default())?;
//! let handle = orchestrator.submit(TransferRequest::from_file("my-bucket", "data.bin", "data.bin"))?;
//! handle.await_completion(None).await;
//! ```

mod client;
mod error;

pub use client::{AwsCredentials, ClientSettings, CrtStorageClient};
pub use error::CrtError;
