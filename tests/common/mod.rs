//! Shared fixtures for integration tests.
//!
//! Runners are driven through a recording [`FakeExecutor`] so no container
//! runtime is needed on the test host.

#![allow(dead_code)]

use async_trait::async_trait;
use cubexec::crypto::{self, DecryptionKey, SymmetricKeyMaterial};
use cubexec::keys::{EncryptedContainerKeyRef, IdentityStore, KeyRegistry};
use cubexec::resources::{InMemorySource, LocalFileSource};
use cubexec::{
    CommandExecutor, ContainerConfig, DigestLookup, EngineConfig, ExecOutput, ImageCache,
    Invocation, ResourceFetcher, Result, RetryPolicy, RunnerContext, RuntimeKind,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

pub const APPTAINER_VERSION: &str = "apptainer version 1.2.5";
pub const OLD_SINGULARITY_VERSION: &str = "singularity version 3.8.0";

// =============================================================================
// Command Executor
// =============================================================================

type Handler = dyn Fn(&Invocation) -> ExecOutput + Send + Sync;

/// Records every invocation and answers with a scripted output.
///
/// A successful `build <output> <source>` writes a placeholder image at
/// `<output>` unless [`FakeExecutor::without_build_output`] is set.
pub struct FakeExecutor {
    calls: Mutex<Vec<Invocation>>,
    handler: Box<Handler>,
    build_output: bool,
}

impl FakeExecutor {
    /// Answers `--version` like apptainer 1.2.5 and everything else with
    /// an empty success.
    pub fn new() -> Self {
        Self::with_version(APPTAINER_VERSION)
    }

    pub fn with_version(version: &'static str) -> Self {
        Self::with_handler(move |inv| {
            if inv.args == ["--version"] {
                ok(version)
            } else {
                ok("")
            }
        })
    }

    pub fn with_handler(handler: impl Fn(&Invocation) -> ExecOutput + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            build_output: true,
        }
    }

    /// Builds report success without writing anything.
    pub fn without_build_output(mut self) -> Self {
        self.build_output = false;
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose first argument is `subcommand`.
    pub fn calls_to(&self, subcommand: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.args.first().is_some_and(|a| a == subcommand))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<ExecOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let output = (self.handler)(invocation);
        if self.build_output
            && output.success()
            && invocation.args.first().is_some_and(|a| a == "build")
            && let Some(target) = invocation.args.get(1)
        {
            std::fs::write(target, b"SIF")?;
        }
        Ok(output)
    }
}

pub fn ok(output: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        output: output.to_string(),
    }
}

pub fn failed(code: i32, output: &str) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        output: output.to_string(),
    }
}

// =============================================================================
// Registry Fakes
// =============================================================================

/// Returns the same digest for every image.
pub struct FixedDigest(pub String);

#[async_trait]
impl DigestLookup for FixedDigest {
    async fn manifest_digest(&self, _image: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Key registry holding at most one wrapped key.
#[derive(Default)]
pub struct StaticKeyRegistry {
    pub material: Option<SymmetricKeyMaterial>,
}

#[async_trait]
impl KeyRegistry for StaticKeyRegistry {
    async fn container_key(
        &self,
        _container_id: &str,
        _key_ref: &EncryptedContainerKeyRef,
    ) -> Result<Option<SymmetricKeyMaterial>> {
        Ok(self.material.clone())
    }
}

/// Identity store holding at most one PEM key.
#[derive(Default)]
pub struct StaticIdentity {
    pub pem: Option<String>,
}

impl IdentityStore for StaticIdentity {
    fn private_key_pem(&self, _authority: &str) -> Result<Option<Zeroizing<String>>> {
        Ok(self.pem.clone().map(Zeroizing::new))
    }
}

pub fn key_ref() -> EncryptedContainerKeyRef {
    EncryptedContainerKeyRef {
        authority: "ca.example.org".to_string(),
        certificate: Some("cert-1".to_string()),
    }
}

// =============================================================================
// Engine And Manifests
// =============================================================================

/// Engine rooted in `root` that never waits between retries.
pub fn engine(root: &Path, runtime: RuntimeKind) -> EngineConfig {
    let mut engine = EngineConfig::with_root(root);
    engine.runtime = runtime;
    engine.download = RetryPolicy::immediate(1);
    engine
}

pub fn manifest(yaml: &str) -> ContainerConfig {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    ContainerConfig::from_value(value, PathBuf::from("workspace")).unwrap()
}

/// Simple-dialect manifest with an `infer` task reading `data_path` and
/// writing `output_path`.
pub fn infer_manifest(container_type: &str, image: &str) -> ContainerConfig {
    manifest(&format!(
        r#"
container_type: {}
image: "{}"
tasks:
  infer:
    input_volumes:
      data_path:
        mount_path: /data
        type: directory
    output_volumes:
      output_path:
        mount_path: /out
        type: directory
"#,
        container_type, image
    ))
}

pub fn fetcher(engine: &EngineConfig, memory: Arc<InMemorySource>) -> ResourceFetcher {
    let cache = ImageCache::with_path(engine.images_dir.clone()).unwrap();
    ResourceFetcher::new(engine.tmp_dir.clone(), cache)
        .unwrap()
        .with_source(memory)
        .with_source(Arc::new(LocalFileSource))
}

pub fn context(
    engine: EngineConfig,
    manifest: ContainerConfig,
    fetcher: Arc<ResourceFetcher>,
    container_id: &str,
    executor: Arc<FakeExecutor>,
) -> RunnerContext {
    let container_dir = engine.container_dir(container_id);
    RunnerContext::new(Arc::new(manifest), Arc::new(engine), fetcher, container_dir)
        .unwrap()
        .with_executor(executor)
        .with_digest_lookup(Arc::new(FixedDigest("sha256:feed".to_string())))
}

/// Host directories bound to the `infer` task.
pub fn infer_mounts(root: &Path) -> (PathBuf, PathBuf) {
    let data = root.join("data");
    std::fs::create_dir_all(&data).unwrap();
    (data, root.join("out"))
}

// =============================================================================
// Images
// =============================================================================

/// A minimal `docker save` archive tagged `tags`.
pub fn docker_archive(tags: &[&str]) -> Vec<u8> {
    let manifest = serde_json::json!([{ "Config": "config.json", "RepoTags": tags, "Layers": [] }]);
    let manifest = serde_json::to_vec(&manifest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "manifest.json", manifest.as_slice())
        .unwrap();
    builder.into_inner().unwrap()
}

/// Encrypts `plaintext` and returns the ciphertext with its key.
pub fn encrypt(dir: &Path, plaintext: &[u8]) -> (Vec<u8>, DecryptionKey) {
    let key = [7u8; 32];
    let nonce = [9u8; 12];
    let aad = b"cubexec-test".to_vec();

    let input = dir.join("plain.bin");
    let output = dir.join("cipher.bin");
    std::fs::write(&input, plaintext).unwrap();
    let tag = crypto::encrypt_file(&key, &nonce, &aad, &input, &output).unwrap();
    let ciphertext = std::fs::read(&output).unwrap();
    std::fs::remove_file(&input).unwrap();
    std::fs::remove_file(&output).unwrap();

    (ciphertext, DecryptionKey::new(key, nonce, tag, aad))
}

/// Same key as the one [`encrypt`] used, for tests that need it twice.
pub fn same_key(key: &DecryptionKey) -> DecryptionKey {
    DecryptionKey::new([7u8; 32], *key.nonce(), *key.tag(), b"cubexec-test".to_vec())
}

/// Fresh RSA key pair as `(private PKCS#8 PEM, public SPKI PEM)`.
pub fn rsa_pair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let private_pem = private.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    (private_pem, public_pem)
}

/// Wraps the key [`encrypt`] uses for the holder of `public_pem`.
pub fn wrapped_material(public_pem: &str, key: &DecryptionKey) -> SymmetricKeyMaterial {
    SymmetricKeyMaterial {
        encrypted_key: crypto::wrap_key(public_pem, &[7u8; 32]).unwrap(),
        nonce: key.nonce().to_vec(),
        tag: key.tag().to_vec(),
        associated_data: b"cubexec-test".to_vec(),
    }
}
