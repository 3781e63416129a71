//! Shared constants for end-to-end tests
//!
//! When registry fixtures or timings change, update only this file.

// ============================================================================
// Registry Fixtures
// ============================================================================

/// Application with its own ORD webhook
pub const APP_WITH_WEBHOOK_ID: &str = "app-direct";

/// Application template carrying an ORD webhook
pub const TEMPLATE_ID: &str = "template-1";

/// Application created from TEMPLATE_ID
pub const TEMPLATE_APP_ID: &str = "app-from-template";

/// Application template carrying a static ORD webhook
pub const STATIC_TEMPLATE_ID: &str = "template-static";

/// Application without any webhook
pub const APP_WITHOUT_WEBHOOK_ID: &str = "app-plain";

// ============================================================================
// Test Timeouts and Configuration
// ============================================================================

/// Maximum time to wait for server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Polling interval when waiting for server ready (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 50;

/// Timeout for individual HTTP requests (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How long workers stay idle before polling again (milliseconds)
pub const WORKER_QUIET_PERIOD_MS: u64 = 200;

/// Maximum time to wait for an operation to reach a status (milliseconds)
pub const OPERATION_WAIT_TIMEOUT_MS: u64 = 5000;
