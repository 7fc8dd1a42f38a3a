mod handler_name;
mod payload_type;

/// Derives `PayloadType` for a payload enum whose variants each wrap one message.
///
/// `payload_type()` returns the name of the active variant.
#[proc_macro_derive(PayloadType)]
pub fn payload_type(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    payload_type::payload_type_enum_impl(item)
}

/// Derive macro for generating queue handler names.
///
/// This macro generates a `handler_name()` method that returns a stable identifier
/// for the handler. The name follows the format `"handler:<kebab-case-name>"` and shows up
/// in worker logs and in the information handed to dead-letter callbacks.
///
/// # Basic Usage
///
/// ```ignore
/// use courier_derive::HandlerName;
///
/// #[derive(HandlerName)]
/// struct AppRefreshHandler {
///     // fields...
/// }
///
/// let handler = AppRefreshHandler { /* ... */ };
/// assert_eq!(handler.handler_name(), "handler:app-refresh");
/// ```
///
/// Common suffixes (`Handler`, `Consumer`, `Worker`) are automatically
/// stripped before converting to kebab-case.
///
/// # Custom Name
///
/// ```ignore
/// #[derive(HandlerName)]
/// #[handler_name("my-custom-handler")]
/// struct MyHandler;
///
/// // Returns "handler:my-custom-handler"
/// ```
///
/// # Custom Prefix
///
/// ```ignore
/// #[derive(HandlerName)]
/// #[handler_name(prefix = "stage")]
/// struct DelayHandler;
///
/// // Returns "stage:delay"
/// ```
///
/// # Full Customization
///
/// ```ignore
/// #[derive(HandlerName)]
/// #[handler_name(name = "custom", prefix = "consumer")]
/// struct MyHandler;
///
/// // Returns "consumer:custom"
/// ```
#[proc_macro_derive(HandlerName, attributes(handler_name))]
pub fn handler_name(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    handler_name::handler_name_impl(item)
}
