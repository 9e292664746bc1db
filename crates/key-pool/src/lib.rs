//! API key pool and request dispatcher for a hosted model API
//!
//! Holds a pool of API keys, routes each outbound call through exactly one key,
//! detects rate-limit/quota failures, rotates to the next usable key, retries
//! with backoff, and broadcasts live key status to observers.
//!
//! Key lifecycle:
//! 1. Keys loaded from configuration → status `Available`
//! 2. Dispatcher marks the selected key `InUse` for one remote call
//! 3. Success → back to `Available`, usage counted
//! 4. 429 / RESOURCE_EXHAUSTED → `Exhausted`, cursor rotates to the next `Available` key
//! 5. 404 / rejected key / unexpected failure → `Errored`
//! 6. Date changes → every key lazily back to `Available` with usage reset

pub mod batch;
pub mod broadcast;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod quota;

pub use batch::BatchOutcome;
pub use broadcast::{StatusBroadcaster, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use error::{DispatchError, Error, Result};
pub use pool::{Credential, CredentialPool, CredentialState, StatusSnapshot};
pub use quota::classify;
