//! Global panic hook that routes panic records through `tracing`.
//!
//! The coordinator converts handler panics into job failures after the
//! fact; this hook preserves the stack trace from the panic site itself.

use std::backtrace::Backtrace;
use std::panic::{PanicHookInfo, take_hook};

/// Install the hook, chaining to whatever hook was registered before.
pub fn install() {
    let previous_hook = take_hook();
    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracing::error!(target: "catalyst_vod::panic", "{}", format_panic_record(panic_info));
        }));
        previous_hook(panic_info);
    }));
}

fn format_panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = payload_to_string(panic_info);
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let thread = std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());
    let backtrace = Backtrace::force_capture();
    format!("PANIC thread={thread} location={location} payload={payload}\nBacktrace:\n{backtrace}")
}

/// Extract a panic payload as text.
pub fn payload_to_string(panic_info: &PanicHookInfo<'_>) -> String {
    if let Some(s) = panic_info.payload().downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        return s.clone();
    }
    panic_info.to_string()
}
