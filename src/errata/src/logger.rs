// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging helpers on top of the `log` facade.

/// Logs at `$level` the first time this call site is reached, and never again.
macro_rules! log_once {
    ($level:ident, $($arg:tt)+) => {{
        static LOGGED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        if !LOGGED.swap(true, std::sync::atomic::Ordering::Relaxed) {
            log::$level!($($arg)+);
        }
    }};
}

macro_rules! info_once {
    ($($arg:tt)+) => {
        log_once!(info, $($arg)+)
    };
}

macro_rules! warn_once {
    ($($arg:tt)+) => {
        log_once!(warn, $($arg)+)
    };
}
