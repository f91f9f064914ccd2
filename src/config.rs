//! Cache configuration.

use std::path::{Path, PathBuf};

use snafu::Snafu;

/// Default maximum cache size: 80 MiB.
pub const DEFAULT_CACHE_SIZE: i64 = 80 * 1024 * 1024;

/// Flavors of the cache, selecting policy details.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheType {
    /// General-purpose disk cache: stratified eviction by default.
    Disk,
    /// Application cache: opened read-only; entries are never marked dirty
    /// and ranks are not updated.
    App,
    /// Shader cache: opening an entry does not update its rank unless the
    /// entry was modified.
    Shader,
    /// PNaCl translation cache: the per-entry size limit is raised from
    /// `max_size / 8` to the full `max_size`.
    Pnacl,
}

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Configuration for a cache backend.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Directory holding the index, block files, and external files. Must
    /// be unique per backend, in this process and others.
    pub(crate) path: PathBuf,

    /// Maximum size, in bytes, the stored data may reach; 0 means use the
    /// default. Clamped during init so internal 32-bit accounting keeps 10%
    /// of headroom.
    pub(crate) max_size: i64,

    pub(crate) cache_type: CacheType,

    /// Forces the stratified (multi-list) eviction policy; `None` selects it
    /// per cache type.
    pub(crate) new_eviction: Option<bool>,

    /// Overrides the hash-table mask. Testing only: the mask is normally
    /// derived from the stored table length.
    pub(crate) mask: Option<u32>,

    /// Disables randomized behaviors so tests are deterministic.
    pub(crate) no_random: bool,

    /// Disables the write-back user buffers; writes go straight to storage.
    pub(crate) no_buffering: bool,

    /// Disables trim throttling under load.
    pub(crate) no_load_protection: bool,

    /// Shortens timers and makes shutdown wait for pending operations.
    pub(crate) unit_test_mode: bool,

    /// Halts a rankings mutation mid-flight at the given point, simulating
    /// a crash. Testing only.
    pub(crate) crash_point: Option<crate::rankings::CrashPoint>,
}

/// Builder for [`CacheConfig`].
#[derive(Clone, Debug)]
pub struct CacheConfigBuilder {
    path: PathBuf,
    max_size: Option<i64>,
    cache_type: CacheType,
    new_eviction: Option<bool>,
    mask: Option<u32>,
    no_random: bool,
    no_buffering: bool,
    no_load_protection: bool,
    unit_test_mode: bool,
    crash_point: Option<crate::rankings::CrashPoint>,
}

impl CacheConfigBuilder {
    pub fn from_path<P>(path: P) -> CacheConfigBuilder
    where
        P: AsRef<Path>,
    {
        CacheConfigBuilder {
            path: path.as_ref().to_path_buf(),
            max_size: None,
            cache_type: CacheType::Disk,
            new_eviction: None,
            mask: None,
            no_random: false,
            no_buffering: false,
            no_load_protection: false,
            unit_test_mode: false,
            crash_point: None,
        }
    }

    /// Sets the maximum size, in bytes, the stored data may reach.
    ///
    /// Defaults to 80 MiB. Values within 10% of `i32::MAX` are clamped so
    /// byte accounting keeps headroom.
    pub fn max_size(mut self, amount: i64) -> Self {
        self.max_size = Some(amount);
        self
    }

    /// Selects the cache flavor. Defaults to [`CacheType::Disk`].
    pub fn cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }

    /// Forces the eviction policy: `true` for the stratified multi-list
    /// policy, `false` for classic single-list LRU.
    pub fn new_eviction(mut self, enabled: bool) -> Self {
        self.new_eviction = Some(enabled);
        self
    }

    /// Overrides the hash-table mask. Testing only.
    pub fn mask(mut self, mask: u32) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Disables randomized behaviors so tests are deterministic.
    pub fn no_random(mut self) -> Self {
        self.no_random = true;
        self
    }

    /// Disables the write-back user buffers.
    pub fn no_buffering(mut self) -> Self {
        self.no_buffering = true;
        self
    }

    /// Disables trim throttling under load.
    pub fn no_load_protection(mut self) -> Self {
        self.no_load_protection = true;
        self
    }

    /// Shortens timers and makes shutdown wait for pending operations.
    pub fn unit_test_mode(mut self) -> Self {
        self.unit_test_mode = true;
        self
    }

    /// Simulates a crash at the given point of the next matching rankings
    /// mutation.
    #[cfg(test)]
    pub(crate) fn crash_point(mut self, point: crate::rankings::CrashPoint) -> Self {
        self.crash_point = Some(point);
        self
    }

    /// Consumes this builder and constructs a `CacheConfig`.
    pub fn build(self) -> Result<CacheConfig, BuildError> {
        let max_size = self.max_size.unwrap_or(0);
        if max_size < 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_size",
                reason: "cannot be negative".to_string(),
            });
        }

        if let Some(mask) = self.mask {
            if mask != 0 && !(mask + 1).is_power_of_two() {
                return Err(BuildError::InvalidParameter {
                    param_name: "mask",
                    reason: "must be one less than a power of two".to_string(),
                });
            }
        }

        Ok(CacheConfig {
            path: self.path,
            max_size,
            cache_type: self.cache_type,
            new_eviction: self.new_eviction,
            mask: self.mask,
            no_random: self.no_random,
            no_buffering: self.no_buffering,
            no_load_protection: self.no_load_protection,
            unit_test_mode: self.unit_test_mode,
            crash_point: self.crash_point,
        })
    }
}
