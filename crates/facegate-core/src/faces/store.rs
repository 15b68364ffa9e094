use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use facegate_config::ExtractionMethod;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error};

use crate::errors::{AppError, AppResult};
use crate::faces::extractor::Embedding;

const TEMPLATE_DIR: &str = "templates";
const METADATA_DIR: &str = "metadata";
const TEMPLATE_VERSION: u32 = 1;
const STORE_ALGORITHM: &str = "AES-256-GCM";
const STORE_NONCE_LEN: usize = 12;
const TEMPLATE_KEY_LEN: usize = 32;
const MAX_IDENTITY_LEN: usize = 128;

/// The single live reference embedding for one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentTemplate {
    pub identity: String,
    pub embedding: Embedding,
    /// L2 norm of the embedding.
    pub quality: f64,
    pub created_at: DateTime<Utc>,
    pub config_version: String,
    pub extraction_method: ExtractionMethod,
    pub source: Option<String>,
}

impl EnrollmentTemplate {
    pub fn new(
        identity: impl Into<String>,
        embedding: Embedding,
        config_version: impl Into<String>,
        extraction_method: ExtractionMethod,
    ) -> Self {
        let quality = embedding.l2_norm();
        Self {
            identity: identity.into(),
            embedding,
            quality,
            created_at: Utc::now(),
            config_version: config_version.into(),
            extraction_method,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn metadata(&self) -> TemplateMetadata {
        TemplateMetadata {
            identity: self.identity.clone(),
            enrolled_at: Some(self.created_at),
            quality: Some(self.quality),
            config_version: Some(self.config_version.clone()),
            extraction_method: Some(self.extraction_method),
            embedding_len: Some(self.embedding.len()),
            source: self.source.clone(),
        }
    }
}

/// Descriptive record kept next to each template. Fields are optional so a
/// template without its metadata file still yields a minimal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TemplateMetadata {
    pub fn minimal(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            enrolled_at: None,
            quality: None,
            config_version: None,
            extraction_method: None,
            embedding_len: None,
            source: None,
        }
    }
}

/// Owner of persisted templates. At most one live template per identity;
/// concurrent saves for the same identity are serialized.
pub trait TemplateStore: Send + Sync {
    fn exists(&self, identity: &str) -> bool;
    fn save(&self, template: EnrollmentTemplate, overwrite: bool)
        -> AppResult<EnrollmentTemplate>;
    fn load(&self, identity: &str) -> AppResult<Embedding>;
    fn metadata(&self, identity: &str) -> AppResult<TemplateMetadata>;
    fn list(&self) -> AppResult<Vec<String>>;
    /// Returns whether a template was removed.
    fn delete(&self, identity: &str) -> AppResult<bool>;
}

pub fn validate_identity(identity: &str) -> AppResult<()> {
    let invalid = |message: &str| AppError::InvalidIdentity {
        identity: identity.to_string(),
        message: message.to_string(),
    };

    if identity.is_empty() {
        return Err(invalid("identity cannot be empty"));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(invalid("identity is longer than 128 characters"));
    }
    if identity.starts_with('.') {
        return Err(invalid("identity cannot start with '.'"));
    }
    if !identity
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
    {
        return Err(invalid("use ASCII letters, numbers, '-', '_' or '.' only"));
    }

    Ok(())
}

/// 256-bit AES-GCM key protecting template files at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct TemplateKey([u8; TEMPLATE_KEY_LEN]);

impl TemplateKey {
    pub fn new(bytes: [u8; TEMPLATE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> AppResult<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| AppError::Encryption(format!("invalid template key encoding: {err}")))?;
        let bytes: [u8; TEMPLATE_KEY_LEN] = bytes.try_into().map_err(|raw: Vec<u8>| {
            AppError::Encryption(format!(
                "template key must be {TEMPLATE_KEY_LEN} bytes, found {}",
                raw.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; TEMPLATE_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.0)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TemplateKey(..)")
    }
}

#[derive(Default)]
struct IdentityLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    /// Runs `f` under the lock for `identity`. The entry is dropped again once
    /// no other caller holds or waits on it.
    fn with_lock<T>(&self, identity: &str, f: impl FnOnce() -> T) -> T {
        let handle = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&handle) == 2 {
            map.remove(identity);
        }
        result
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Templates under `<root>/templates/<identity>.json`, metadata under
/// `<root>/metadata/<identity>.json`.
pub struct FilesystemTemplateStore {
    root: PathBuf,
    key: Option<TemplateKey>,
    locks: IdentityLocks,
}

impl FilesystemTemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key: None,
            locks: IdentityLocks::default(),
        }
    }

    pub fn with_key(mut self, key: Option<TemplateKey>) -> Self {
        self.key = key;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template_path(&self, identity: &str) -> PathBuf {
        self.root
            .join(TEMPLATE_DIR)
            .join(format!("{identity}.json"))
    }

    pub fn metadata_path(&self, identity: &str) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(format!("{identity}.json"))
    }

    /// Writes the template, then its metadata. A failed metadata write puts
    /// the previous template back so the pair never disagrees.
    fn save_locked(
        &self,
        template: EnrollmentTemplate,
        overwrite: bool,
    ) -> AppResult<EnrollmentTemplate> {
        let template_path = self.template_path(&template.identity);
        let previous = match fs::read(&template_path) {
            Ok(data) => Some(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(AppError::TemplateRead {
                    path: template_path,
                    source,
                })
            }
        };
        if previous.is_some() && !overwrite {
            return Err(AppError::AlreadyEnrolled {
                identity: template.identity.clone(),
            });
        }

        let stored = StoredTemplate {
            version: TEMPLATE_VERSION,
            identity: template.identity.clone(),
            embedding: template.embedding.as_slice().to_vec(),
        };
        let payload = match &self.key {
            Some(key) => serialize_encrypted(&stored, key)?,
            None => serde_json::to_vec_pretty(&stored)?,
        };
        let metadata = serde_json::to_vec_pretty(&template.metadata())?;

        write_atomic(&template_path, &payload)?;
        if let Err(err) = write_atomic(&self.metadata_path(&template.identity), &metadata) {
            roll_back(&template_path, previous.as_deref());
            return Err(err);
        }

        debug!(
            identity = %template.identity,
            path = %template_path.display(),
            encrypted = self.key.is_some(),
            "template persisted"
        );
        Ok(template)
    }
}

fn roll_back(path: &Path, previous: Option<&[u8]>) {
    let outcome = match previous {
        Some(data) => write_atomic(path, data.strip_suffix(b"\n").unwrap_or(data)),
        None => fs::remove_file(path).map_err(|source| AppError::TemplateWrite {
            path: path.to_path_buf(),
            source,
        }),
    };
    if let Err(err) = outcome {
        error!(path = %path.display(), error = %err, "failed to restore previous template");
    }
}

impl TemplateStore for FilesystemTemplateStore {
    fn exists(&self, identity: &str) -> bool {
        validate_identity(identity).is_ok() && self.template_path(identity).is_file()
    }

    fn save(
        &self,
        template: EnrollmentTemplate,
        overwrite: bool,
    ) -> AppResult<EnrollmentTemplate> {
        validate_identity(&template.identity)?;
        let identity = template.identity.clone();
        self.locks
            .with_lock(&identity, || self.save_locked(template, overwrite))
    }

    fn load(&self, identity: &str) -> AppResult<Embedding> {
        validate_identity(identity)?;
        let path = self.template_path(identity);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AppError::NotEnrolled {
                    identity: identity.to_string(),
                })
            }
            Err(source) => return Err(AppError::TemplateRead { path, source }),
        };

        let stored = if let Ok(wrapper) = serde_json::from_slice::<EncryptedTemplate>(&data) {
            decrypt_template(&path, wrapper, self.key.as_ref())?
        } else {
            serde_json::from_slice::<StoredTemplate>(&data).map_err(|err| {
                AppError::InvalidTemplate {
                    path: path.clone(),
                    message: format!("invalid template contents: {err}"),
                }
            })?
        };
        validate_stored(&path, identity, stored)
    }

    fn metadata(&self, identity: &str) -> AppResult<TemplateMetadata> {
        validate_identity(identity)?;
        if !self.template_path(identity).is_file() {
            return Err(AppError::NotEnrolled {
                identity: identity.to_string(),
            });
        }
        let path = self.metadata_path(identity);
        match fs::read(&path) {
            Ok(data) => {
                serde_json::from_slice(&data).map_err(|err| AppError::InvalidTemplate {
                    path,
                    message: format!("invalid metadata contents: {err}"),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(TemplateMetadata::minimal(identity))
            }
            Err(source) => Err(AppError::TemplateRead { path, source }),
        }
    }

    fn list(&self) -> AppResult<Vec<String>> {
        let dir = self.root.join(TEMPLATE_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(AppError::TemplateRead { path: dir, source }),
        };

        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AppError::TemplateRead {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(identity) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_identity(identity).is_ok() && path.is_file() {
                    identities.push(identity.to_string());
                }
            }
        }
        identities.sort();
        Ok(identities)
    }

    fn delete(&self, identity: &str) -> AppResult<bool> {
        validate_identity(identity)?;
        self.locks.with_lock(identity, || {
            let template_path = self.template_path(identity);
            let existed = template_path.is_file();
            for path in [template_path, self.metadata_path(identity)] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(AppError::TemplateWrite { path, source }),
                }
            }
            Ok(existed)
        })
    }
}

/// Process-local store for embedding callers and tests.
#[derive(Default)]
pub struct MemoryTemplateStore {
    templates: Mutex<BTreeMap<String, EnrollmentTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn exists(&self, identity: &str) -> bool {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(identity)
    }

    fn save(
        &self,
        template: EnrollmentTemplate,
        overwrite: bool,
    ) -> AppResult<EnrollmentTemplate> {
        validate_identity(&template.identity)?;
        let mut templates = self.templates.lock().unwrap_or_else(PoisonError::into_inner);
        if templates.contains_key(&template.identity) && !overwrite {
            return Err(AppError::AlreadyEnrolled {
                identity: template.identity.clone(),
            });
        }
        templates.insert(template.identity.clone(), template.clone());
        Ok(template)
    }

    fn load(&self, identity: &str) -> AppResult<Embedding> {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .map(|template| template.embedding.clone())
            .ok_or_else(|| AppError::NotEnrolled {
                identity: identity.to_string(),
            })
    }

    fn metadata(&self, identity: &str) -> AppResult<TemplateMetadata> {
        self.templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .map(EnrollmentTemplate::metadata)
            .ok_or_else(|| AppError::NotEnrolled {
                identity: identity.to_string(),
            })
    }

    fn list(&self) -> AppResult<Vec<String>> {
        Ok(self
            .templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    fn delete(&self, identity: &str) -> AppResult<bool> {
        Ok(self
            .templates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
            .is_some())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredTemplate {
    version: u32,
    identity: String,
    embedding: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct EncryptedTemplate {
    version: u32,
    algorithm: String,
    nonce: String,
    ciphertext: String,
}

fn validate_stored(path: &Path, identity: &str, stored: StoredTemplate) -> AppResult<Embedding> {
    let invalid = |message: String| AppError::InvalidTemplate {
        path: path.to_path_buf(),
        message,
    };
    if stored.version != TEMPLATE_VERSION {
        return Err(invalid(format!(
            "unsupported template version {}",
            stored.version
        )));
    }
    if stored.identity != identity {
        return Err(invalid(format!(
            "template belongs to '{}', expected '{identity}'",
            stored.identity
        )));
    }
    if stored.embedding.is_empty() {
        return Err(invalid("embedding is empty".into()));
    }
    if stored.embedding.iter().any(|value| !value.is_finite()) {
        return Err(invalid("embedding contains non-finite values".into()));
    }
    Ok(Embedding::new(stored.embedding))
}

fn write_atomic(path: &Path, payload: &[u8]) -> AppResult<()> {
    let write_err = |source: io::Error| AppError::TemplateWrite {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| AppError::TemplateWrite {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            writer.write_all(payload).map_err(write_err)?;
            writer.write_all(b"\n").map_err(write_err)?;
            writer.flush().map_err(write_err)?;
        }
        file.sync_all().map_err(write_err)?;
    }

    let file = tmp.persist(path).map_err(|err| write_err(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(write_err)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(write_err)?;
    }

    Ok(())
}

fn serialize_encrypted(stored: &StoredTemplate, key: &TemplateKey) -> AppResult<Vec<u8>> {
    let plaintext = serde_json::to_vec(stored)?;
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| AppError::Encryption("invalid AES-GCM key length".into()))?;
    let mut nonce = [0u8; STORE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|err| AppError::Encryption(format!("failed to encrypt template: {err}")))?;
    let wrapper = EncryptedTemplate {
        version: TEMPLATE_VERSION,
        algorithm: STORE_ALGORITHM.to_string(),
        nonce: general_purpose::STANDARD.encode(nonce),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
    };
    serde_json::to_vec_pretty(&wrapper).map_err(AppError::from)
}

fn decrypt_template(
    path: &Path,
    wrapper: EncryptedTemplate,
    key: Option<&TemplateKey>,
) -> AppResult<StoredTemplate> {
    if wrapper.algorithm != STORE_ALGORITHM {
        return Err(AppError::Encryption(format!(
            "unsupported template algorithm '{}'",
            wrapper.algorithm
        )));
    }
    if wrapper.version != TEMPLATE_VERSION {
        return Err(AppError::Encryption(format!(
            "unsupported encrypted template version {}",
            wrapper.version
        )));
    }

    let key = key.ok_or_else(|| AppError::EncryptedTemplateRequiresKey {
        path: path.to_path_buf(),
    })?;

    let nonce_bytes = general_purpose::STANDARD
        .decode(wrapper.nonce.trim())
        .map_err(|err| AppError::Encryption(format!("invalid nonce encoding: {err}")))?;
    if nonce_bytes.len() != STORE_NONCE_LEN {
        return Err(AppError::Encryption(format!(
            "expected nonce of {} bytes but found {}",
            STORE_NONCE_LEN,
            nonce_bytes.len()
        )));
    }

    let ciphertext = general_purpose::STANDARD
        .decode(wrapper.ciphertext.trim())
        .map_err(|err| AppError::Encryption(format!("invalid ciphertext encoding: {err}")))?;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| AppError::Encryption("invalid AES-GCM key length".into()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|err| AppError::Encryption(format!("failed to decrypt template: {err}")))?;

    serde_json::from_slice(&plaintext).map_err(|err| AppError::InvalidTemplate {
        path: path.to_path_buf(),
        message: format!("invalid decrypted template contents: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn template(identity: &str, values: Vec<f64>) -> EnrollmentTemplate {
        EnrollmentTemplate::new(
            identity,
            Embedding::new(values),
            "1.0",
            ExtractionMethod::Simple,
        )
    }

    #[test]
    fn filesystem_store_round_trip_without_encryption() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        store
            .save(template("alice", vec![0.1, 0.2, 0.3]), false)
            .unwrap();

        assert!(store.exists("alice"));
        assert_eq!(store.load("alice").unwrap().as_slice(), &[0.1, 0.2, 0.3]);
        let metadata = store.metadata("alice").unwrap();
        assert_eq!(metadata.embedding_len, Some(3));
        assert_eq!(metadata.config_version.as_deref(), Some("1.0"));
    }

    #[test]
    fn filesystem_store_round_trip_with_encryption() {
        let tmp = TempDir::new().unwrap();
        let key = TemplateKey::new([0x22u8; 32]);
        let store = FilesystemTemplateStore::new(tmp.path()).with_key(Some(key.clone()));
        store.save(template("bob", vec![1.0, -1.0]), false).unwrap();

        let raw = fs::read_to_string(store.template_path("bob")).unwrap();
        assert!(raw.contains(STORE_ALGORITHM));
        assert!(!raw.contains("\"embedding\""));
        assert_eq!(store.load("bob").unwrap().as_slice(), &[1.0, -1.0]);

        let keyless = FilesystemTemplateStore::new(tmp.path());
        let err = keyless.load("bob").unwrap_err();
        assert!(matches!(err, AppError::EncryptedTemplateRequiresKey { .. }));
    }

    #[test]
    fn stored_values_reload_bit_exact() {
        let tmp = TempDir::new().unwrap();
        let values: Vec<f64> = (0..=255).map(|v| v as f64 / 255.0).collect();
        let plain = FilesystemTemplateStore::new(tmp.path().join("plain"));
        plain.save(template("pixels", values.clone()), false).unwrap();
        assert_eq!(plain.load("pixels").unwrap().as_slice(), values.as_slice());

        let sealed = FilesystemTemplateStore::new(tmp.path().join("sealed"))
            .with_key(Some(TemplateKey::new([0x33u8; 32])));
        sealed.save(template("pixels", values.clone()), false).unwrap();
        assert_eq!(sealed.load("pixels").unwrap().as_slice(), values.as_slice());
    }

    #[test]
    fn failed_metadata_write_restores_previous_template() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        store.save(template("kate", vec![1.0, 0.0]), false).unwrap();

        // A plain file where the metadata directory belongs blocks every metadata write.
        let metadata_dir = tmp.path().join(METADATA_DIR);
        fs::remove_dir_all(&metadata_dir).unwrap();
        fs::write(&metadata_dir, b"not a directory").unwrap();

        let err = store
            .save(template("kate", vec![0.0, 1.0]), true)
            .unwrap_err();
        assert!(matches!(err, AppError::TemplateWrite { .. }));
        assert_eq!(err.kind(), crate::errors::ErrorKind::Resource);
        assert_eq!(store.load("kate").unwrap().as_slice(), &[1.0, 0.0]);

        let err = store.save(template("liam", vec![1.0]), false).unwrap_err();
        assert!(matches!(err, AppError::TemplateWrite { .. }));
        assert!(!store.exists("liam"));
    }

    #[test]
    fn identity_locks_are_released_after_use() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        for identity in ["mona", "nate", "olga"] {
            store.save(template(identity, vec![1.0]), false).unwrap();
        }
        store.delete("nate").unwrap();
        assert_eq!(store.locks.tracked(), 0);

        thread::scope(|scope| {
            for worker in 0..6 {
                let store = &store;
                scope.spawn(move || {
                    store
                        .save(template("mona", vec![worker as f64 + 1.0]), true)
                        .unwrap();
                });
            }
        });
        assert_eq!(store.locks.tracked(), 0);
    }

    #[test]
    fn second_save_requires_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        store.save(template("carol", vec![1.0, 0.0]), false).unwrap();

        let err = store
            .save(template("carol", vec![0.0, 1.0]), false)
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyEnrolled { .. }));
        assert_eq!(store.load("carol").unwrap().as_slice(), &[1.0, 0.0]);

        store.save(template("carol", vec![0.0, 1.0]), true).unwrap();
        assert_eq!(store.load("carol").unwrap().as_slice(), &[0.0, 1.0]);
    }

    #[test]
    fn missing_identity_is_not_enrolled() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        assert!(!store.exists("dave"));
        assert!(matches!(
            store.load("dave").unwrap_err(),
            AppError::NotEnrolled { .. }
        ));
        assert!(matches!(
            store.metadata("dave").unwrap_err(),
            AppError::NotEnrolled { .. }
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn metadata_falls_back_to_minimal_record() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        store.save(template("erin", vec![1.0]), false).unwrap();
        fs::remove_file(store.metadata_path("erin")).unwrap();

        assert_eq!(
            store.metadata("erin").unwrap(),
            TemplateMetadata::minimal("erin")
        );
    }

    #[test]
    fn corrupt_templates_are_integrity_errors() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        store.save(template("frank", vec![1.0]), false).unwrap();
        fs::write(store.template_path("frank"), b"{not json").unwrap();

        let err = store.load("frank").unwrap_err();
        assert!(matches!(err, AppError::InvalidTemplate { .. }));
        assert_eq!(err.kind(), crate::errors::ErrorKind::Integrity);
    }

    #[test]
    fn list_is_sorted_and_ignores_strays() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        for identity in ["zoe", "adam", "mia"] {
            store.save(template(identity, vec![1.0]), false).unwrap();
        }
        fs::write(tmp.path().join(TEMPLATE_DIR).join("notes.txt"), b"x").unwrap();

        assert_eq!(store.list().unwrap(), vec!["adam", "mia", "zoe"]);
    }

    #[test]
    fn delete_removes_template_and_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        store.save(template("gina", vec![1.0]), false).unwrap();

        assert!(store.delete("gina").unwrap());
        assert!(!store.metadata_path("gina").exists());
        assert!(!store.delete("gina").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn template_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        store.save(template("hank", vec![1.0]), false).unwrap();
        let mode = fs::metadata(store.template_path("hank"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn identity_validation_rejects_path_tricks() {
        let too_long = "x".repeat(129);
        for identity in ["", "../etc", ".hidden", "a/b", "with space", too_long.as_str()] {
            assert!(validate_identity(identity).is_err(), "{identity}");
        }
        for identity in ["alice", "S-1024", "first.last", "id_42"] {
            assert!(validate_identity(identity).is_ok(), "{identity}");
        }
    }

    #[test]
    fn template_key_parses_base64() {
        let key = TemplateKey::generate();
        assert_eq!(TemplateKey::from_base64(&key.to_base64()).unwrap(), key);
        assert!(TemplateKey::from_base64("c2hvcnQ=").is_err());
    }

    #[test]
    fn concurrent_saves_for_one_identity_leave_one_valid_template() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        thread::scope(|scope| {
            for worker in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    store
                        .save(template("shared", vec![worker as f64 + 1.0; 4]), true)
                        .unwrap();
                });
            }
        });

        let loaded = store.load("shared").unwrap();
        let first = loaded.as_slice()[0];
        assert!(loaded.as_slice().iter().all(|value| *value == first));
        assert_eq!(store.list().unwrap(), vec!["shared"]);
    }

    #[test]
    fn concurrent_saves_for_distinct_identities_do_not_interfere() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path());
        thread::scope(|scope| {
            for worker in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    let identity = format!("user{worker}");
                    store
                        .save(template(&identity, vec![worker as f64 + 1.0]), false)
                        .unwrap();
                });
            }
        });

        for worker in 0..8 {
            let loaded = store.load(&format!("user{worker}")).unwrap();
            assert_eq!(loaded.as_slice(), &[worker as f64 + 1.0]);
        }
    }

    #[test]
    fn memory_store_enforces_single_template() {
        let store = MemoryTemplateStore::new();
        store.save(template("ivy", vec![1.0]), false).unwrap();
        assert!(matches!(
            store.save(template("ivy", vec![2.0]), false).unwrap_err(),
            AppError::AlreadyEnrolled { .. }
        ));
        store.save(template("ivy", vec![2.0]), true).unwrap();
        assert_eq!(store.load("ivy").unwrap().as_slice(), &[2.0]);
        assert_eq!(store.list().unwrap(), vec!["ivy"]);
    }
}
