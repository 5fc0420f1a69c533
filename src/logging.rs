//! Logging macros for sfvmk_drivers

#[cfg(feature = "log")]
#[macro_use]
mod log {
    macro_rules! drv_error {
        ($($arg:expr),*) => (error!($($arg),*));
    }
    macro_rules! drv_warn {
        ($($arg:expr),*) => (warn!($($arg),*));
    }
    macro_rules! drv_info {
        ($($arg:expr),*) => (info!($($arg),*));
    }
    macro_rules! drv_debug {
        ($($arg:expr),*) => (debug!($($arg),*));
    }
    macro_rules! drv_trace {
        ($($arg:expr),*) => (trace!($($arg),*));
    }
}

#[cfg(not(feature = "log"))]
#[macro_use]
mod log {
    // Borrow rather than move so call sites can keep using their arguments.
    macro_rules! drv_error {
        ($($arg:expr),*) => { $( let _ = &$arg; )* };
    }
    macro_rules! drv_warn {
        ($($arg:expr),*) => { $( let _ = &$arg; )* };
    }
    macro_rules! drv_info {
        ($($arg:expr),*) => { $( let _ = &$arg; )* };
    }
    macro_rules! drv_debug {
        ($($arg:expr),*) => { $( let _ = &$arg; )* };
    }
    macro_rules! drv_trace {
        ($($arg:expr),*) => { $( let _ = &$arg; )* };
    }
}
