/// Log a warning, and if a debug build then panic.
macro_rules! debug_panic {
    ($($x:tt)+) => {
        log::warn!($($x)+);
        #[cfg(debug_assertions)]
        panic!($($x)+);
    };
}

/// Log a message at `$first_level` the first time this call site is reached, and at
/// `$subsequent_level` afterwards.
macro_rules! log_once_at_level {
    ($first_level:expr, $subsequent_level:expr, $($x:tt)+) => {{
        static HAS_LOGGED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        let level = if HAS_LOGGED.swap(true, std::sync::atomic::Ordering::Relaxed) {
            $subsequent_level
        } else {
            $first_level
        };
        log::log!(level, $($x)+);
    }};
}

/// Log a warning once from this call site, and then downgrade it to trace.
macro_rules! warn_once_then_trace {
    ($($x:tt)+) => {
        log_once_at_level!(log::Level::Warn, log::Level::Trace, $($x)+)
    };
}

#[cfg(test)]
mod tests {
    // will panic in debug mode
    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn debug_panic_macro() {
        debug_panic!("Hello {}", "World");
    }

    // will *not* panic in release mode
    #[test]
    #[cfg(not(debug_assertions))]
    fn debug_panic_macro() {
        debug_panic!("Hello {}", "World");
    }

    #[test]
    fn warn_once_macro() {
        for i in 0..3 {
            warn_once_then_trace!("Logged {} times", i);
        }
    }
}
