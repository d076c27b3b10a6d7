//! Resource Limiter.
//!
//! A process-wide admission controller sitting between the security
//! validator and the execution paths: every execution must acquire a token
//! before an isolate or subprocess is started, and the token is released
//! unconditionally on every exit path (success, error, timeout).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;

#[cfg(feature = "memory-pressure-sensor")]
use sysinfo::System;
#[cfg(feature = "memory-pressure-sensor")]
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimitErrorKind {
    ConcurrencyExceeded,
    MemoryExceeded,
    SystemMemoryPressure,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("resource limit exceeded ({kind:?}): current {current}, max {max}")]
pub struct ResourceLimitError {
    pub kind: ResourceLimitErrorKind,
    pub current: u64,
    pub max: u64,
}

#[derive(Debug, Clone)]
pub struct ResourceLimiterConfig {
    /// Default 10.
    pub max_concurrent: usize,
    /// Default 3072 MB.
    pub max_memory_mb: u64,
    /// Off by default; when on, `acquire` also rejects new work while host
    /// memory usage is at or above `memory_pressure_threshold_percent`.
    pub memory_pressure_sensor_enabled: bool,
    /// Default 80.
    pub memory_pressure_threshold_percent: u8,
}

impl Default for ResourceLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_memory_mb: 3072,
            memory_pressure_sensor_enabled: false,
            memory_pressure_threshold_percent: 80,
        }
    }
}

/// Held by a caller for the lifetime of one execution. Dropping it releases
/// both the concurrency slot and the reserved memory, so `release` is never
/// forgotten even on a panicking or early-returning code path.
pub struct ResourceToken {
    _permit: OwnedSemaphorePermit,
    memory_mb: u64,
    memory_in_use: Arc<AtomicU64>,
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        self.memory_in_use
            .fetch_sub(self.memory_mb, Ordering::SeqCst);
    }
}

pub struct ResourceLimiter {
    config: ResourceLimiterConfig,
    semaphore: Arc<Semaphore>,
    memory_in_use: Arc<AtomicU64>,
    #[cfg(feature = "memory-pressure-sensor")]
    system: AsyncMutex<System>,
}

impl ResourceLimiter {
    pub fn new(config: ResourceLimiterConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            memory_in_use: Arc::new(AtomicU64::new(0)),
            #[cfg(feature = "memory-pressure-sensor")]
            system: AsyncMutex::new(System::new()),
        }
    }

    /// `acquire(memoryMb) -> token`. Checks, in order: host
    /// memory pressure (if the sensor is enabled), the concurrency cap, then
    /// the configured memory cap.
    pub async fn acquire(&self, memory_mb: u64) -> Result<ResourceToken, ResourceLimitError> {
        self.check_memory_pressure().await?;

        let permit = Arc::clone(&self.semaphore).try_acquire_owned().map_err(|_| {
            let current = (self.config.max_concurrent - self.semaphore.available_permits()) as u64;
            tracing::warn!(current, max = self.config.max_concurrent, "concurrency cap rejected acquire");
            ResourceLimitError {
                kind: ResourceLimitErrorKind::ConcurrencyExceeded,
                current,
                max: self.config.max_concurrent as u64,
            }
        })?;

        let reserved = self.memory_in_use.fetch_add(memory_mb, Ordering::SeqCst) + memory_mb;
        if reserved > self.config.max_memory_mb {
            self.memory_in_use.fetch_sub(memory_mb, Ordering::SeqCst);
            tracing::warn!(reserved, max = self.config.max_memory_mb, "memory cap rejected acquire");
            return Err(ResourceLimitError {
                kind: ResourceLimitErrorKind::MemoryExceeded,
                current: reserved,
                max: self.config.max_memory_mb,
            });
        }

        Ok(ResourceToken {
            _permit: permit,
            memory_mb,
            memory_in_use: Arc::clone(&self.memory_in_use),
        })
    }

    /// `release(token)`. Provided for symmetry with `acquire`;
    /// the token already releases on drop, so this simply makes the release
    /// point explicit at call sites.
    pub fn release(&self, token: ResourceToken) {
        drop(token);
    }

    pub fn available_concurrency(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn memory_in_use_mb(&self) -> u64 {
        self.memory_in_use.load(Ordering::SeqCst)
    }

    #[cfg(feature = "memory-pressure-sensor")]
    async fn check_memory_pressure(&self) -> Result<(), ResourceLimitError> {
        if !self.config.memory_pressure_sensor_enabled {
            return Ok(());
        }
        let mut system = self.system.lock().await;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Ok(());
        }
        let used = system.used_memory();
        let percent = ((used as f64 / total as f64) * 100.0) as u64;
        if percent >= self.config.memory_pressure_threshold_percent as u64 {
            return Err(ResourceLimitError {
                kind: ResourceLimitErrorKind::SystemMemoryPressure,
                current: percent,
                max: self.config.memory_pressure_threshold_percent as u64,
            });
        }
        Ok(())
    }

    #[cfg(not(feature = "memory-pressure-sensor"))]
    async fn check_memory_pressure(&self) -> Result<(), ResourceLimitError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_free_the_concurrency_slot() {
        let limiter = ResourceLimiter::new(ResourceLimiterConfig {
            max_concurrent: 1,
            ..Default::default()
        });
        let token = limiter.acquire(10).await.expect("first acquire succeeds");
        assert_eq!(limiter.available_concurrency(), 0);
        limiter.release(token);
        assert_eq!(limiter.available_concurrency(), 1);
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_the_nth_plus_one_acquire() {
        let limiter = ResourceLimiter::new(ResourceLimiterConfig {
            max_concurrent: 1,
            ..Default::default()
        });
        let _first = limiter.acquire(1).await.expect("first acquire succeeds");
        let err = limiter.acquire(1).await.unwrap_err();
        assert_eq!(err.kind, ResourceLimitErrorKind::ConcurrencyExceeded);
    }

    #[tokio::test]
    async fn memory_cap_rejects_and_refunds_the_reservation() {
        let limiter = ResourceLimiter::new(ResourceLimiterConfig {
            max_concurrent: 10,
            max_memory_mb: 100,
            ..Default::default()
        });
        let err = limiter.acquire(101).await.unwrap_err();
        assert_eq!(err.kind, ResourceLimitErrorKind::MemoryExceeded);
        // The failed reservation must not leak into memory_in_use.
        assert_eq!(limiter.memory_in_use_mb(), 0);
    }

    #[tokio::test]
    async fn dropping_a_token_without_explicit_release_still_frees_resources() {
        let limiter = ResourceLimiter::new(ResourceLimiterConfig {
            max_concurrent: 1,
            ..Default::default()
        });
        {
            let _token = limiter.acquire(50).await.expect("acquire succeeds");
            assert_eq!(limiter.memory_in_use_mb(), 50);
        }
        assert_eq!(limiter.memory_in_use_mb(), 0);
        assert_eq!(limiter.available_concurrency(), 1);
    }
}
