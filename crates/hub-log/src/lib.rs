//! Conditional logging macros for the integration hub.
//!
//! In normal builds these forward to `tracing`. With the `bare` feature
//! enabled they fall back to `println!`/`eprintln!`, for embedding contexts
//! where no tracing subscriber is ever installed.

#[cfg(not(feature = "bare"))]
#[doc(hidden)]
pub use tracing;

#[cfg(feature = "bare")]
#[doc(hidden)]
#[inline]
pub fn _log_info_impl(msg: std::fmt::Arguments<'_>) {
    println!("[INFO] {msg}");
}

#[cfg(feature = "bare")]
#[doc(hidden)]
#[inline]
pub fn _log_warn_impl(msg: std::fmt::Arguments<'_>) {
    eprintln!("[WARN] {msg}");
}

#[cfg(feature = "bare")]
#[doc(hidden)]
#[inline]
pub fn _log_error_impl(msg: std::fmt::Arguments<'_>) {
    eprintln!("[ERROR] {msg}");
}

#[cfg(feature = "bare")]
#[doc(hidden)]
#[inline]
pub fn _log_debug_impl(msg: std::fmt::Arguments<'_>) {
    #[cfg(debug_assertions)]
    println!("[DEBUG] {msg}");
    #[cfg(not(debug_assertions))]
    let _ = msg;
}

/// Log an info-level message.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        #[cfg(not(feature = "bare"))]
        $crate::tracing::info!($($arg)*);
        #[cfg(feature = "bare")]
        $crate::_log_info_impl(format_args!($($arg)*));
    };
}

/// Log a warning-level message.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        #[cfg(not(feature = "bare"))]
        $crate::tracing::warn!($($arg)*);
        #[cfg(feature = "bare")]
        $crate::_log_warn_impl(format_args!($($arg)*));
    };
}

/// Log an error-level message.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        #[cfg(not(feature = "bare"))]
        $crate::tracing::error!($($arg)*);
        #[cfg(feature = "bare")]
        $crate::_log_error_impl(format_args!($($arg)*));
    };
}

/// Log a debug-level message.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(not(feature = "bare"))]
        $crate::tracing::debug!($($arg)*);
        #[cfg(feature = "bare")]
        $crate::_log_debug_impl(format_args!($($arg)*));
    };
}
