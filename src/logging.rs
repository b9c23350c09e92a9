//! Helper macros enforcing consistent dispatcher log fields.
//!
//! These macros keep the `action` field (and optionally `topic`) present on
//! every log emitted from the runtime layers so downstream parsing can rely
//! on them.

/// Log an event for an action/topic pair plus any extra fields.
#[macro_export]
macro_rules! dispatch_event {
    ($level:ident, $target:expr, $event:expr, action = $action:expr, topic = $topic:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            action = %$action,
            topic = %$topic,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, action = $action:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            action = %$action,
            $($field = %$value,)*
        )
    };
}
