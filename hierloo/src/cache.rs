//! Compiled-model cache
//!
//! Compiling a Stan program takes tens of seconds, so executables are
//! memoized by the SHA-256 content hash of the [`ModelSpec`]. Each spec gets
//! its own directory `<root>/<hash>/` holding the generated `.stan` file and
//! the executable built next to it. Equal specs share one executable; any
//! change to the spec changes the hash and forces a rebuild.

use crate::codegen::generate_stan;
use crate::error::Result;
use crate::model::ModelSpec;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct ModelCache {
    root: PathBuf,
    executables: HashMap<String, PathBuf>,
}

impl ModelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            executables: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the Stan source for `spec` into its cache directory unless an
    /// identical file is already there. Returns the `.stan` path.
    pub fn stan_file(&self, spec: &ModelSpec) -> Result<PathBuf> {
        let dir = self.root.join(spec.content_hash());
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.stan", spec.name()));
        let source = generate_stan(spec)?;
        let unchanged = fs::read_to_string(&path)
            .map(|existing| existing == source)
            .unwrap_or(false);
        if !unchanged {
            fs::write(&path, source)?;
        }
        Ok(path)
    }

    /// Executable for `spec`, built with `compile` on first use.
    ///
    /// `compile` receives the `.stan` path and returns the executable path.
    /// An executable already present on disk from an earlier run is reused.
    pub fn executable<F>(&mut self, spec: &ModelSpec, compile: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<PathBuf>,
    {
        let key = spec.content_hash();
        if let Some(exe) = self.executables.get(&key) {
            debug!(model = %spec.name(), "compiled model found in memory cache");
            return Ok(exe.clone());
        }

        let stan_file = self.stan_file(spec)?;
        let exe = stan_file.with_extension("");
        let exe = if exe.exists() {
            debug!(model = %spec.name(), path = %exe.display(), "reusing compiled model");
            exe
        } else {
            compile(&stan_file)?
        };
        self.executables.insert(key, exe.clone());
        Ok(exe)
    }

    pub fn len(&self) -> usize {
        self.executables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Link, SaveRateSpec};
    use tempfile::TempDir;

    fn fake_compile(calls: &mut usize) -> impl FnOnce(&Path) -> Result<PathBuf> + '_ {
        move |stan: &Path| {
            *calls += 1;
            let exe = stan.with_extension("");
            fs::write(&exe, b"")?;
            Ok(exe)
        }
    }

    #[test]
    fn test_compiles_once_per_spec() {
        let dir = TempDir::new().unwrap();
        let mut cache = ModelCache::new(dir.path());
        let spec = ModelSpec::SaveRate(SaveRateSpec::fixed_scale(0.5, Link::Logit));

        let mut calls = 0;
        let first = cache.executable(&spec, fake_compile(&mut calls)).unwrap();
        let second = cache.executable(&spec, fake_compile(&mut calls)).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls, 1);

        let other = ModelSpec::SaveRate(SaveRateSpec::fixed_scale(1.0, Link::Logit));
        let third = cache.executable(&other, fake_compile(&mut calls)).unwrap();
        assert_ne!(first, third);
        assert_eq!(calls, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reuses_executable_from_previous_run() {
        let dir = TempDir::new().unwrap();
        let spec = ModelSpec::SaveRate(SaveRateSpec::independent());
        let mut calls = 0;
        ModelCache::new(dir.path())
            .executable(&spec, fake_compile(&mut calls))
            .unwrap();

        let mut fresh = ModelCache::new(dir.path());
        fresh.executable(&spec, fake_compile(&mut calls)).unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_stan_file_written_under_hash() {
        let dir = TempDir::new().unwrap();
        let cache = ModelCache::new(dir.path());
        let spec = ModelSpec::SaveRate(SaveRateSpec::independent()).with_log_lik();
        let path = cache.stan_file(&spec).unwrap();
        assert!(path.starts_with(dir.path().join(spec.content_hash())));
        assert!(fs::read_to_string(path).unwrap().contains("log_lik"));
    }
}
