//! ============================================================================
//! Retry Logic - Exponential Backoff & Error Classification
//! ============================================================================
//! Shared by every outbound call that may fail transiently:
//! - Exponential backoff with jitter, capped at a maximum delay
//! - Error classification (retryable, rate limited, permanent)
//! ============================================================================

use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries (multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Config with no waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error is likely transient, should retry
    Retryable,
    /// Rate limited, back off more aggressively
    RateLimited,
    /// Error is permanent, don't retry
    Permanent,
}

/// Classify an HTTP status plus response body
pub fn classify_status(status: u16, body: &str) -> ErrorKind {
    let lower = body.to_lowercase();

    if status == 429 {
        // Quota exhaustion shares 429 with rate limiting but never recovers
        if lower.contains("insufficient_quota") || lower.contains("exceeded your current quota") {
            return ErrorKind::Permanent;
        }
        return ErrorKind::RateLimited;
    }

    if status == 408 || status >= 500 {
        return ErrorKind::Retryable;
    }

    if (400..500).contains(&status) {
        return ErrorKind::Permanent;
    }

    classify_error(body)
}

/// Classify an error message to determine if retry is appropriate
pub fn classify_error(error: &str) -> ErrorKind {
    let lower = error.to_lowercase();

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
        return ErrorKind::RateLimited;
    }

    // Permanent errors - don't retry these
    if lower.contains("invalid input")
        || lower.contains("invalid_request")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("insufficient_quota")
        || lower.contains("maximum context length")
    {
        return ErrorKind::Permanent;
    }

    // Default to retryable for network and unknown errors
    ErrorKind::Retryable
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter && capped_delay > 0 {
        // Add random jitter (0-50% of delay)
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}
