//! §7 requires error-path logging to always carry `(module, arena_id,
//! player_id)` context. Rather than a structured-logging framework, this is
//! a small formatting helper used at call sites, matching the teacher's
//! preference for plain `log` macros over an added dependency.

/// Formats the `(module, arena_id, player_id)` triple into a log message.
/// `arena_id`/`player_id` accept `Option<&str>`-like display via `Option<T:
/// Display>`; pass `None` when the event isn't scoped to one.
#[macro_export]
macro_rules! log_ctx {
    ($level:ident, $module:expr, $arena:expr, $player:expr, $($arg:tt)*) => {
        log::$level!(
            "[{}][arena={}][player={}] {}",
            $module,
            $crate::logging::opt_display(&$arena),
            $crate::logging::opt_display(&$player),
            format_args!($($arg)*),
        )
    };
}

/// Renders an `Option<impl Display>` as `"-"` when absent, used by
/// [`log_ctx!`].
pub fn opt_display<T: std::fmt::Display>(v: &Option<T>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn log_ctx_compiles_with_and_without_scope() {
        log_ctx!(warn, "arena", Some(3u32), None::<u32>, "holds stuck at {}", 2);
        log_ctx!(info, "broker", None::<u32>, None::<u32>, "ready");
    }
}
