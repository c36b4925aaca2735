/// Panics in debug builds, logs an error and continues in release builds.
///
/// Used at the "programmer error" boundaries spec.md §7 calls out: invalid
/// event ids, deleting an already-deleted channel, mutating a Connection
/// from a non-owning thread. These conditions should never happen; we want
/// a hard failure while developing and a loud log line (rather than a
/// crashed process) in the field.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else { tracing::error!($($arg)*) })
}

/// Debug-time assertion that degrades to a logged error in release builds.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr $(,)?) => {
        #[cfg(debug_assertions)]
        {
            debug_assert!($cond);
        }
        #[cfg(not(debug_assertions))]
        {
            if !$cond {
                tracing::error!("ASSERT FAILED: {}", stringify!($cond));
            }
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            debug_assert!($cond, $($arg)+);
        }
        #[cfg(not(debug_assertions))]
        {
            if !$cond {
                tracing::error!("ASSERT FAILED: {}", format!($($arg)+));
            }
        }
    };
}
