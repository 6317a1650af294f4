//! Invocation cache
//!
//! Records of successful tool calls keyed by a SHA-256 fingerprint of the
//! call and the content of its input files. Storage backends sit behind the
//! `CacheStore` trait so tests can use an in-memory store.

use super::ToolCall;
use crate::error::{CestError, CestResult};
use crate::transform::spec_token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Directory created under the working directory for cache records
pub const CACHE_DIR_NAME: &str = ".cestreg_cache";

/// A successful, replayable tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub fingerprint: String,
    pub program: String,
    pub command_line: Vec<String>,
    pub outputs: BTreeMap<String, PathBuf>,
    pub stdout: String,
    pub recorded_at: DateTime<Utc>,
}

impl InvocationRecord {
    pub fn new(fingerprint: String, call: &ToolCall, stdout: &str) -> Self {
        Self {
            fingerprint,
            program: call.program.clone(),
            command_line: call.command_line(),
            outputs: call.outputs.clone(),
            stdout: stdout.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Storage for invocation records
pub trait CacheStore: Send + Sync {
    fn get(&self, fingerprint: &str) -> CestResult<Option<InvocationRecord>>;

    fn put(&self, record: &InvocationRecord) -> CestResult<()>;
}

/// One JSON file per record in `<working_dir>/.cestreg_cache/`
#[derive(Debug, Clone)]
pub struct JsonCacheStore {
    dir: PathBuf,
}

impl JsonCacheStore {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            dir: working_dir.join(CACHE_DIR_NAME),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint))
    }
}

impl CacheStore for JsonCacheStore {
    fn get(&self, fingerprint: &str) -> CestResult<Option<InvocationRecord>> {
        let path = self.record_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&text) {
            Ok(record) => Ok(Some(record)),
            // A corrupt record is a miss; it gets overwritten on the next put
            Err(_) => Ok(None),
        }
    }

    fn put(&self, record: &InvocationRecord) -> CestResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CestError::Cache(format!("failed to create {}: {}", self.dir.display(), e))
        })?;
        let text = serde_json::to_string_pretty(record)?;
        std::fs::write(self.record_path(&record.fingerprint), text)?;
        Ok(())
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    records: Mutex<HashMap<String, InvocationRecord>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, fingerprint: &str) -> CestResult<Option<InvocationRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|e| CestError::Cache(e.to_string()))?;
        Ok(records.get(fingerprint).cloned())
    }

    fn put(&self, record: &InvocationRecord) -> CestResult<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| CestError::Cache(e.to_string()))?;
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }
}

/// SHA-256 of a file's content, hex encoded
pub fn hash_file(path: &Path) -> CestResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint of a call as run from `working_dir`.
///
/// Covers the program, arguments, environment and the content of every
/// argument naming an existing file that is not one of the call's outputs,
/// so regenerating an input invalidates every call downstream of it.
pub fn fingerprint(working_dir: &Path, call: &ToolCall) -> CestResult<String> {
    let mut hasher = Sha256::new();
    let mut field = |label: &str, value: &str| {
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    };

    field("cwd", &working_dir.to_string_lossy());
    field("program", &call.program);
    for arg in call.command_line() {
        field("arg", &arg);
    }
    for (key, value) in &call.environ {
        field("env", &format!("{}={}", key, value));
    }
    if let Some(path) = &call.stdout_to {
        field("stdout", &path.to_string_lossy());
    }

    let outputs: Vec<&Path> = call
        .outputs
        .values()
        .map(PathBuf::as_path)
        .chain(call.stdout_to.as_deref())
        .collect();

    for value in call.argument_values() {
        // Warp specifications list several paths in one argument
        for token in value.split_whitespace() {
            let path = Path::new(spec_token(token).0);
            if outputs.contains(&path) || !path.is_file() {
                continue;
            }
            field("input", &format!("{}:{}", token, hash_file(path)?));
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unifize_call(input: &Path, output: &Path) -> ToolCall {
        ToolCall::new("3dUnifize")
            .opt("-prefix", output)
            .opt("-input", input)
            .output("out_file", output)
    }

    #[test]
    fn test_hash_file_empty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            hash_file(file.path()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_fingerprint_tracks_input_content() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("anat.nii");
        let output = dir.path().join("anat_unifized.nii");
        std::fs::write(&input, b"first").unwrap();
        let call = unifize_call(&input, &output);

        let first = fingerprint(dir.path(), &call).unwrap();
        assert_eq!(first, fingerprint(dir.path(), &call).unwrap());

        std::fs::write(&input, b"second").unwrap();
        assert_ne!(first, fingerprint(dir.path(), &call).unwrap());
    }

    #[test]
    fn test_fingerprint_ignores_output_content() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("anat.nii");
        let output = dir.path().join("anat_unifized.nii");
        std::fs::write(&input, b"data").unwrap();
        let call = unifize_call(&input, &output);

        let before = fingerprint(dir.path(), &call).unwrap();
        std::fs::write(&output, b"result").unwrap();
        assert_eq!(before, fingerprint(dir.path(), &call).unwrap());
    }

    #[test]
    fn test_fingerprint_reads_inverted_warp_inputs() {
        let dir = TempDir::new().unwrap();
        let coreg = dir.path().join("anat_to_cest.aff12.1D");
        std::fs::write(&coreg, "1 0 0 0 0 1 0 0 0 0 1 0").unwrap();
        let call = ToolCall::new("3dNwarpApply").opt("-nwarp", format!("INV({})", coreg.display()));

        let first = fingerprint(dir.path(), &call).unwrap();
        std::fs::write(&coreg, "1 0 0 2 0 1 0 0 0 0 1 0").unwrap();
        assert_ne!(first, fingerprint(dir.path(), &call).unwrap());
    }

    #[test]
    fn test_fingerprint_depends_on_environment_and_cwd() {
        let dir = TempDir::new().unwrap();
        let call = ToolCall::new("3dWarp").flag("-quintic");
        let mut environ = BTreeMap::new();
        environ.insert("AFNI_DECONFLICT".to_string(), "OVERWRITE".to_string());

        let plain = fingerprint(dir.path(), &call).unwrap();
        let with_env = fingerprint(dir.path(), &call.clone().environ(&environ)).unwrap();
        let elsewhere = fingerprint(Path::new("/elsewhere"), &call).unwrap();
        assert_ne!(plain, with_env);
        assert_ne!(plain, elsewhere);
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonCacheStore::new(dir.path());
        let call = ToolCall::new("3dClipLevel").arg("anat.nii");
        let record = InvocationRecord::new("abc123".to_string(), &call, "250.5\n");

        assert!(store.get("abc123").unwrap().is_none());
        store.put(&record).unwrap();
        assert!(store.dir().join("abc123.json").exists());
        assert_eq!(store.get("abc123").unwrap(), Some(record));
    }

    #[test]
    fn test_corrupt_record_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let store = JsonCacheStore::new(dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("bad.json"), "{not json").unwrap();
        assert!(store.get("bad").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCacheStore::new();
        let record = InvocationRecord::new("fp".to_string(), &ToolCall::new("3dcopy"), "");
        store.put(&record).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("fp").unwrap().is_some());
        assert!(store.get("other").unwrap().is_none());
    }
}
