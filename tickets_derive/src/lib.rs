mod handler_name;
mod message_data;

/// Derive macro for closed message catalogues.
///
/// Every variant must wrap exactly one payload type. The wire name of a
/// variant defaults to the variant identifier and can be overridden with
/// `#[message(name = "...")]`, which is how versioned names such as
/// `BookingMade_v1` are kept stable while the Rust identifiers stay idiomatic.
///
/// ```ignore
/// use tickets_derive::MessageData;
///
/// #[derive(Debug, Clone, MessageData)]
/// enum ShopEvent {
///     #[message(name = "OrderPlaced_v1")]
///     OrderPlaced(OrderPlaced),
///     OrderShipped(OrderShipped),
/// }
///
/// assert_eq!(<OrderPlaced as NamedMessage>::NAME, "OrderPlaced_v1");
/// ```
///
/// The generated code implements `MessageData` for the enum, `NamedMessage`
/// for every payload type, `From<Payload> for Enum` and
/// `TryFrom<Enum> for Payload`.
#[proc_macro_derive(MessageData, attributes(message))]
pub fn message_data(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    message_data::message_data_enum_impl(item)
}

/// Derive macro for stable handler names.
///
/// The handler name decides the durable consumer group
/// (`<service>.<handler>`), so it is generated once from the struct name
/// and never computed at runtime.
///
/// # Basic Usage
///
/// ```ignore
/// use tickets_derive::HandlerName;
///
/// #[derive(HandlerName)]
/// struct PrintTicketHandler;
///
/// assert_eq!(PrintTicketHandler.handler_name(), "PrintTicket");
/// ```
///
/// A trailing `Handler` is stripped.
///
/// # Custom Name
///
/// ```ignore
/// #[derive(HandlerName)]
/// #[handler_name("events_splitter")]
/// struct EventsSplitter;
/// ```
///
/// # Prefix
///
/// ```ignore
/// #[derive(HandlerName)]
/// #[handler_name(name = "OnBookingMade", prefix = "ops_read_model")]
/// struct OnBookingMade;
///
/// // Returns "ops_read_model.OnBookingMade"
/// ```
#[proc_macro_derive(HandlerName, attributes(handler_name))]
pub fn handler_name(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    handler_name::handler_name_impl(item)
}
