//! Habit-tracker API client
//!
//! Request pipeline with transparent credential refresh. The pipeline
//! attaches the stored bearer token to every outbound call, classifies the
//! response, and on authorization failure obtains a fresh credential through
//! a single-flight coordinator before retrying the call exactly once. When
//! refresh is impossible the session is torn down deterministically and the
//! host is signalled to re-authenticate.
//!
//! Request lifecycle:
//! 1. `ApiClient::execute()` reads the credential slot (empty → fail fast)
//! 2. Dispatch with `Authorization: Bearer <access>`
//! 3. 401 → `RefreshCoordinator::obtain_fresh_credential()` (one exchange
//!    shared by all concurrently failing calls), then one retry
//! 4. 401 on the retry, or refresh unavailable → `SessionTerminator`
//! 5. Everything else is returned to the caller untouched

pub mod classify;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod refresh;
pub mod session;

pub use classify::{Classification, classify_status};
pub use config::ClientConfig;
pub use error::{Failure, Result};
pub use pipeline::{ApiClient, ApiRequest, ApiResponse};
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use session::{SessionEvent, SessionTerminator};
