#![allow(unused_macros)]

macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::trace!($($arg)+);
    }
}

macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::debug!($($arg)+);
    }
}

macro_rules! warn {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::warn!($($arg)+);
    }
}

macro_rules! error {
    ($($arg:tt)+) => {
        #[cfg(feature = "layers")]
        tracing::error!($($arg)+);
    }
}
