//! # cubexec
//!
//! **Container Execution and Secure Resource Acquisition**
//!
//! Runs vendor-supplied compute units (data preparation, model and metric
//! containers) on the local machine through Docker or Singularity/Apptainer,
//! including encrypted model images whose plaintext must never outlive a run.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              cubexec                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                       Runner Trait                          │    │
//! │  │        download(hashes) ──► run(task, RunRequest)           │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                 Container Manifests                       │      │
//! │  │  cube / simple dialect → TaskDescriptor → ExecutionPlan   │      │
//! │  │  Volumes ro/rw │ Run-arg allow-list │ GPU normalization   │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │               Resource Acquisition                        │      │
//! │  │  Sources │ Retry policy │ Hash check │ Content-addressed  │      │
//! │  │  image cache with per-container links and per-hash locks  │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Runner Backends                              │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌──────────────────────┐   │
//! │  │ DockerRunner │  │ SingularityRunner│  │ PrivateRunner<B>     │   │
//! │  │  docker CLI  │  │ singularity /    │  │ key resolution +     │   │
//! │  │  pull/load   │  │ apptainer, SIF   │  │ AES-GCM stream +     │   │
//! │  │              │  │                  │  │ guaranteed cleanup   │   │
//! │  └──────────────┘  └──────────────────┘  └──────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! Isolation is the container runtime's job. This crate guarantees:
//!
//! - **Hash Verification**: images and files whose computed hash disagrees
//!   with the recorded one are rejected before they are published.
//! - **Key Hygiene**: unwrapped content keys live in zeroizing buffers and are
//!   consumed by a single decryption.
//! - **Plaintext Cleanup**: decrypted and converted images are removed on every
//!   exit path; the container's link to the encrypted image is removed too
//!   unless the key proves the caller owns the container. Cached blobs are
//!   never evicted automatically.
//! - **No Global State**: GPU selection and forwarded variables are passed in
//!   each subprocess's own environment.
//!
//! # Example
//!
//! ```rust,ignore
//! use cubexec::{create_runner, ContainerConfig, EngineConfig, ImageHashes,
//!     ResourceFetcher, RunRequest, RunnerContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cubexec::Result<()> {
//!     let engine = Arc::new(EngineConfig::default());
//!     let manifest = Arc::new(ContainerConfig::load("cube/container-config.yaml".as_ref())?);
//!     let fetcher = Arc::new(ResourceFetcher::from_config(&engine)?);
//!     let ctx = RunnerContext::new(manifest, engine.clone(), fetcher, engine.container_dir("42"))?;
//!
//!     let mut runner = create_runner(ctx, None).await?;
//!     runner.download(&ImageHashes::any()).await?;
//!     runner
//!         .run("infer", &RunRequest::new().mount("data_path", "/data"))
//!         .await
//! }
//! ```

pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod process;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod storage;

pub mod runtimes;

// Re-exports
pub use config::{EngineConfig, RuntimeKind};
pub use crypto::{DecryptionKey, SymmetricKeyMaterial};
pub use error::{Error, Result};
pub use keys::{
    ContainerIdentity, EncryptedContainerKeyRef, FileIdentityStore, IdentityStore, KeyRegistry,
    KeyResolver, KeySource, ResolvedKey,
};
pub use manifest::{
    ContainerConfig, ContainerType, GpuRequest, IoType, MountBindings, RunArgs, TaskDescriptor,
    Volume, VolumeKind,
};
pub use process::{CommandExecutor, ExecOutput, Invocation, ProcessExecutor};
pub use registry::{DigestLookup, DockerHubClient};
pub use resources::{CachedImage, ResourceFetcher, RetryPolicy, Source};
pub use runtime::{ExecutionPlan, ImageHashes, RunRequest, Runner, RunnerState};
pub use runtimes::{
    DockerRunner, PrivateContext, PrivateRunner, RunnerContext, SingularityRunner, create_runner,
};
pub use storage::ImageCache;
