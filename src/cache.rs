//! Caching of compiled kernels.
use crate::config::CompilerParameters;
use crate::error::CompileError;
use crate::kernel::CompiledKernel;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Identifies a compiled kernel by the structure of its expression and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Combines the structural hash of an expression with the sorted compilation parameters.
    pub fn new(expression_hash: u64, parameters: &CompilerParameters) -> Self {
        let mut hasher = FxHasher::default();
        expression_hash.hash(&mut hasher);
        parameters.to_string().hash(&mut hasher);
        Self(format!("{:016x}{:016x}", expression_hash, hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A store of compiled kernels, shared by all compilations in a process.
///
/// Implementations must compile each key at most once, also under concurrent requests.
/// Failed compilations must not be stored.
pub trait KernelCache: Send + Sync {
    fn get_or_compile(
        &self,
        key: &CacheKey,
        compile: &mut dyn FnMut() -> Result<CompiledKernel, CompileError>,
    ) -> Result<Arc<CompiledKernel>, CompileError>;
}

/// A kernel cache that keeps every kernel for the lifetime of the cache.
#[derive(Debug, Default)]
pub struct InMemoryKernelCache {
    kernels: Mutex<FxHashMap<CacheKey, Arc<CompiledKernel>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl InMemoryKernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.kernels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

impl KernelCache for InMemoryKernelCache {
    fn get_or_compile(
        &self,
        key: &CacheKey,
        compile: &mut dyn FnMut() -> Result<CompiledKernel, CompileError>,
    ) -> Result<Arc<CompiledKernel>, CompileError> {
        // The lock is held while compiling, so concurrent requests for a key wait for the first
        let mut kernels = self.kernels.lock();
        if let Some(kernel) = kernels.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Kernel cache hit for {}", key);
            return Ok(Arc::clone(kernel));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Kernel cache miss for {}", key);
        let kernel = Arc::new(compile()?);
        kernels.insert(key.clone(), Arc::clone(&kernel));
        Ok(kernel)
    }
}
