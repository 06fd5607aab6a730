//! Registered internal events: metric handles created once per label set and
//! emitted many times.

mod planner;

pub use planner::*;

/// An event description that can be turned into a reusable handle.
pub trait RegisterInternalEvent: Sized {
    type Handle: InternalEventHandle;

    fn register(self) -> Self::Handle;

    fn name(&self) -> Option<&'static str> {
        None
    }
}

pub trait InternalEventHandle: Sized {
    type Data;

    fn emit(&self, data: Self::Data);
}

/// Registers an event and returns its handle.
#[macro_export]
macro_rules! register {
    ($event:expr) => {
        $crate::planner::internal_event::RegisterInternalEvent::register($event)
    };
}

/// Declares a registered event and its handle.
///
/// ```ignore
/// registered_event! {
///     NodeCallObserved { route: String, } => {
///         latency: Histogram = histogram!("latency", "route" => self.route.clone()),
///     }
///
///     fn emit(&self, duration: Duration) {
///         self.latency.record(duration);
///     }
/// }
/// ```
///
/// The field initializers run once inside `register` and may read the event's
/// tags through `self`.
#[macro_export]
macro_rules! registered_event {
    ($event:ident => $($tail:tt)*) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $event;

        $crate::registered_event!(=> $event $($tail)*);
    };

    ($event:ident { $( $tag:ident: $tag_type:ty, )* } => $($tail:tt)*) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $event {
            $( pub $tag: $tag_type, )*
        }

        $crate::registered_event!(=> $event $($tail)*);
    };

    (
        => $event:ident {
            $( $field:ident: $type:ty = $value:expr, )*
        }

        fn emit(&$slf:ident, $data_name:ident: $data:ty)
            $emit_body:block
    ) => {
        paste::paste! {
            #[derive(Clone)]
            pub struct [<$event Handle>] {
                $( $field: $type, )*
            }

            impl $crate::planner::internal_event::RegisterInternalEvent for $event {
                type Handle = [<$event Handle>];

                fn name(&self) -> Option<&'static str> {
                    Some(stringify!($event))
                }

                fn register($slf) -> Self::Handle {
                    Self::Handle {
                        $( $field: $value, )*
                    }
                }
            }

            impl $crate::planner::internal_event::InternalEventHandle for [<$event Handle>] {
                type Data = $data;

                fn emit(&$slf, $data_name: $data)
                    $emit_body
            }
        }
    };
}
