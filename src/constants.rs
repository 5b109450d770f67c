//! # Engine Constants
//!
//! Defines the prefixes, file names, timeouts and defaults used across the
//! engine. These constants are the **single source of truth** for literal
//! values; modules refer to them by name instead of repeating strings.
//!
//! ## Cross-References
//!
//! - [`crate::manifest`]: container types, allowed run args, mount prefixes
//! - [`crate::resources`]: source prefixes, retry bounds, chunk sizes
//! - [`crate::crypto`]: AEAD parameters
//! - [`crate::runtimes`]: executables, env prefixes, version thresholds

use std::time::Duration;

// =============================================================================
// Container Types
// =============================================================================
//
// Closed set of values accepted by the `container_type` manifest key.
// =============================================================================

/// Plain image pulled from a registry.
pub const CONTAINER_TYPE_DOCKER_IMAGE: &str = "docker-image";

/// Image saved with `docker save`.
pub const CONTAINER_TYPE_DOCKER_ARCHIVE: &str = "docker-archive";

/// AEAD-encrypted `docker save` archive.
pub const CONTAINER_TYPE_ENCRYPTED_DOCKER_ARCHIVE: &str = "encrypted-docker-archive";

/// Native SIF file.
pub const CONTAINER_TYPE_SINGULARITY_FILE: &str = "singularity-file";

/// AEAD-encrypted SIF file.
pub const CONTAINER_TYPE_ENCRYPTED_SINGULARITY_FILE: &str = "encrypted-singularity-file";

/// Every accepted container type, in the order reported in errors.
pub const CONTAINER_TYPES: [&str; 5] = [
    CONTAINER_TYPE_DOCKER_IMAGE,
    CONTAINER_TYPE_DOCKER_ARCHIVE,
    CONTAINER_TYPE_ENCRYPTED_DOCKER_ARCHIVE,
    CONTAINER_TYPE_SINGULARITY_FILE,
    CONTAINER_TYPE_ENCRYPTED_SINGULARITY_FILE,
];

// =============================================================================
// Manifest Run Arguments
// =============================================================================

/// Run arguments a manifest is allowed to declare.
///
/// `network` and `ports` are reserved for the caller.
pub const ALLOWED_RUN_ARGS: [&str; 5] = ["shm_size", "gpus", "command", "entrypoint", "environment"];

/// Mount path prefix for legacy dialect parameters (`/mlcube_io0`, ...).
pub const CUBE_MOUNT_PREFIX: &str = "/mlcube_io";

/// Mount point of the caller-supplied scratch folder.
pub const TMP_MOUNT_PATH: &str = "/tmp";

/// Environment variable carrying the container log level.
pub const CONTAINER_LOGLEVEL_ENV: &str = "CUBEXEC_LOGLEVEL";

/// Default container log level.
pub const DEFAULT_CONTAINER_LOGLEVEL: &str = "debug";

/// Network mode used when network access is disabled.
pub const NETWORK_NONE: &str = "none";

// =============================================================================
// Resource Sources
// =============================================================================

/// Prefix for direct links (`direct:<url>`).
pub const DIRECT_SOURCE_PREFIX: &str = "direct";

/// Prefix for the data-commons platform (`synapse:syn<digits>`).
pub const DATA_COMMONS_SOURCE_PREFIX: &str = "synapse";

/// Prefix for registered in-memory buffers (`memory:<name>`).
pub const MEMORY_SOURCE_PREFIX: &str = "memory";

/// Default number of download attempts for direct links.
pub const DEFAULT_DOWNLOAD_ATTEMPTS: u32 = 3;

/// Base delay between download attempts.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// Growth factor applied to the retry delay after each attempt.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Upper bound on the delay between two download attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Per-request timeout for direct-link downloads (30 minutes).
///
/// **Rationale**: image archives can reach tens of GiB on slow links.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Read buffer used for hashing, copying and decryption (64 KiB).
pub const IO_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// Storage Layout
// =============================================================================
//
// All paths are relative to the configured storage root, which defaults to
// `~/.cubexec`.
// =============================================================================

/// Default storage root directory name under the home directory.
pub const DEFAULT_STORAGE_DIR: &str = ".cubexec";

/// Shared content-addressed image cache.
///
/// Structure: `images/<2-char-prefix>/<full-hash>`
pub const IMAGES_DIR: &str = "images";

/// Lock files guarding first-time population of a cache entry.
pub const LOCKS_DIR: &str = "locks";

/// Scratch space for in-flight downloads.
pub const TMP_DIR: &str = "tmp";

/// Per-container storage root.
pub const CONTAINERS_DIR: &str = "containers";

/// Local model-owner keys, `keys/<authority>/<container>.key`.
pub const KEYS_DIR: &str = "keys";

/// User private keys, `pki/<authority>/key.pem`.
pub const PKI_DIR: &str = "pki";

/// File name of a user private key inside its authority directory.
pub const PRIVATE_KEY_FILE: &str = "key.pem";

/// Extension of a local owner key file.
pub const OWNER_KEY_EXTENSION: &str = "key";

/// Per-container image directory.
pub const CONTAINER_IMAGE_DIR: &str = "image";

/// Name of the per-container symlink into the shared cache.
pub const CONTAINER_IMAGE_LINK: &str = "container_image";

/// Suffix appended to a plaintext image produced by decryption.
pub const DECRYPTED_SUFFIX: &str = "_decrypted";

/// Extracted additional files of a container.
pub const ADDITIONAL_FILES_DIR: &str = "additional_files";

/// Records the hash of the extracted additional files tarball.
pub const CACHE_METADATA_FILE: &str = ".cache_metadata.yaml";

/// Per-container manifest file name.
pub const CONTAINER_MANIFEST_FILE: &str = "container-config.yaml";

/// Per-container parameters file name.
pub const PARAMETERS_FILE: &str = "parameters.yaml";

/// Index file inside a `docker save` archive.
pub const DOCKER_ARCHIVE_MANIFEST: &str = "manifest.json";

// =============================================================================
// Runtime Executables
// =============================================================================

/// Docker CLI executable.
pub const DOCKER_EXECUTABLE: &str = "docker";

/// Singularity-family executables, probed in order.
pub const SINGULARITY_EXECUTABLES: [&str; 2] = ["singularity", "apptainer"];

/// `--version` output prefixes identifying the runtime family.
pub const SINGULARITY_VERSION_PREFIX: &str = "singularity version ";
pub const SINGULARITY_CE_VERSION_PREFIX: &str = "singularity-ce version ";
pub const APPTAINER_VERSION_PREFIX: &str = "apptainer version ";

/// Singularity env-injection prefix.
pub const SINGULARITY_ENV_PREFIX: &str = "SINGULARITYENV_";

/// Apptainer env-injection prefix.
pub const APPTAINER_ENV_PREFIX: &str = "APPTAINERENV_";

/// GPU visibility variable read by the NVIDIA container CLI.
pub const GPU_VISIBILITY_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

/// First singularity release with `--nvccli` per-device isolation.
pub const MIN_SINGULARITY_NVCCLI_VERSION: (u32, u32) = (3, 10);

/// Extension of converted native images.
pub const SIF_EXTENSION: &str = "sif";

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for `--version` probes (10 seconds).
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for image pull/build/load operations (1 hour).
///
/// **Rationale**: large GPU images routinely take tens of minutes to pull
/// and convert; the bound only exists to catch stuck processes.
pub const IMAGE_PREPARE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Timeout for registry metadata requests (60 seconds).
pub const REGISTRY_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Registry
// =============================================================================

/// Docker Hub token endpoint.
pub const DOCKER_HUB_AUTH_URL: &str = "https://auth.docker.io/token";

/// Docker Hub registry API.
pub const DOCKER_HUB_REGISTRY_URL: &str = "https://registry-1.docker.io/v2";

/// Manifest media types accepted when resolving a digest.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

// =============================================================================
// Cryptography
// =============================================================================

/// AES-256 key length in bytes.
pub const AEAD_KEY_LEN: usize = 32;

/// GCM nonce length in bytes.
pub const AEAD_NONCE_LEN: usize = 12;

/// GCM tag length in bytes.
pub const AEAD_TAG_LEN: usize = 16;
