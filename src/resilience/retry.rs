// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use dual_sync_engine::RetryConfig;
//! use std::time::Duration;
//!
//! // Connect: a few quick attempts before a job gives up on a database
//! let connect = RetryConfig::connect();
//! assert_eq!(connect.max_retries, Some(3));
//!
//! // Scheduled: whole-job retries, a minute apart
//! let scheduled = RetryConfig::scheduled();
//! assert_eq!(scheduled.max_retries, Some(3));
//! assert_eq!(scheduled.initial_delay, Duration::from_secs(60));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::connect()`] - Quick retry when acquiring a job session
/// - [`RetryConfig::scheduled()`] - Fixed-delay retry for scheduled backups
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::connect()
    }
}

impl RetryConfig {
    /// Quick retry for acquiring a database session.
    /// 3 attempts with fast backoff; a database that is still down after
    /// that fails the job.
    #[must_use]
    pub fn connect() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Retry for scheduled backups: 3 attempts, 60 seconds apart.
    #[must_use]
    pub fn scheduled() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            factor: 1.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}
