//! Provider error classification for ARM calls.
//!
//! Re-exports the engine's transient/fatal split with [`ArmError`] as the
//! default error type, and builds the default ARM [`RetryPolicy`].

use crate::arm::ArmError;
use crate::settings::{RetrySettings, RuleOverride};
pub use step_procedure::OpError;
use step_procedure::{RetryPolicy, RetryRule};
use std::time::Duration;

/// Result of an ARM call, defaulting the error to [`ArmError`].
pub type OpResult<T, E = ArmError> = step_procedure::OpResult<T, E>;

pub const THROTTLING: &str = "Throttling";
pub const INTERNAL_ERROR: &str = "InternalError";
pub const CONFLICT: &str = "Conflict";

#[macro_export]
macro_rules! op_fatal {
    ($msg:literal $(,)?) => {
        return $crate::retry::OpResult::Err($crate::retry::OpError::Fatal(
            $crate::arm::ArmError::client(format!($msg)),
        ))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return $crate::retry::OpResult::Err($crate::retry::OpError::Fatal(
            $crate::arm::ArmError::client(format!($fmt, $($arg)*)),
        ))
    };
}

#[macro_export]
macro_rules! op_transient {
    ($msg:literal $(,)?) => {
        return $crate::retry::OpResult::Err($crate::retry::OpError::Transient(
            $crate::arm::ArmError::network(format!($msg)),
        ))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return $crate::retry::OpResult::Err($crate::retry::OpError::Transient(
            $crate::arm::ArmError::network(format!($fmt, $($arg)*)),
        ))
    };
}

fn is_throttled(e: &ArmError) -> bool {
    e.code == "TooManyRequests" || e.status == Some(429)
}

fn is_internal_error(e: &ArmError) -> bool {
    e.code == "InternalError" || e.code == "InternalServerError"
}

/// A resource is briefly locked by another operation
fn is_in_use(e: &ArmError) -> bool {
    (e.code == "BadRequest" && e.message.contains("is currently in use by"))
        || ((e.code == "ConflictError" || e.code == "Conflict")
            && e.message.contains("that requires exclusive access"))
        || e.code == "AnotherOperationInProgress"
}

/// The default ARM policy: throttling backs off exponentially forever, internal
/// errors and lock conflicts are retried every 10s up to 100 times.
pub fn default_retry_policy() -> RetryPolicy<ArmError> {
    retry_policy(&RetrySettings::default())
}

/// Default rules with delays and budgets replaced from configuration
pub fn retry_policy(settings: &RetrySettings) -> RetryPolicy<ArmError> {
    let throttling = apply(
        RuleOverride {
            delay: Duration::from_secs(5),
            max_delay: Some(Duration::from_secs(120)),
            max_retries: 0,
        },
        settings.throttling.as_ref(),
    );
    let internal = apply(
        RuleOverride {
            delay: Duration::from_secs(10),
            max_delay: None,
            max_retries: 100,
        },
        settings.internal_error.as_ref(),
    );
    let conflict = apply(
        RuleOverride {
            delay: Duration::from_secs(10),
            max_delay: None,
            max_retries: 100,
        },
        settings.conflict.as_ref(),
    );

    RetryPolicy::new()
        .with_rule(RetryRule::exponential(
            THROTTLING,
            is_throttled,
            throttling.delay,
            throttling.max_delay.unwrap_or(throttling.delay),
            throttling.max_retries,
        ))
        .with_rule(RetryRule::constant(
            INTERNAL_ERROR,
            is_internal_error,
            internal.delay,
            internal.max_retries,
        ))
        .with_rule(RetryRule::constant(
            CONFLICT,
            is_in_use,
            conflict.delay,
            conflict.max_retries,
        ))
}

fn apply(default: RuleOverride, over: Option<&RuleOverride>) -> RuleOverride {
    match over {
        Some(o) => RuleOverride {
            delay: o.delay,
            max_delay: o.max_delay.or(default.max_delay),
            max_retries: o.max_retries,
        },
        None => default,
    }
}
