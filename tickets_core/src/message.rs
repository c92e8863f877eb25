//! Typed message catalogues.
//!
//! A catalogue is a closed enum whose variants each wrap one payload type. The
//! `MessageData` derive generates the name table, the codec and the conversions, so routing
//! a payload to its handler is a static lookup built at compile time.

/// A closed set of messages that can be put on the wire.
pub trait MessageData: Sized + Send + Sync + 'static {
    /// The wire name of this variant, such as `BookingMade_v1`.
    fn message_name(&self) -> &'static str;

    /// Every wire name in the catalogue.
    fn message_names() -> &'static [&'static str];

    /// Serializes the wrapped payload.
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error>;

    /// Picks the variant by name and deserializes the payload into it.
    fn decode(name: &str, payload: &[u8]) -> Result<Self, DecodeError>;
}

/// A payload type with a fixed wire name.
pub trait NamedMessage {
    /// The wire name.
    const NAME: &'static str;
}

/// A handler with a stable name. The name decides the durable consumer group.
pub trait HandlerName {
    /// The stable handler name.
    fn handler_name(&self) -> &'static str;
}

/// Errors decoding a message from its name and payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The name is not part of the catalogue.
    #[error("Unknown message '{0}'")]
    UnknownMessage(String),
    /// The payload does not match the schema of the named message.
    #[error("Malformed '{name}' payload: {source}")]
    Malformed {
        /// The wire name that was requested.
        name: String,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// Returned when converting a catalogue enum into a payload of another variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Expected message '{expected}', found '{found}'")]
pub struct UnexpectedMessage {
    /// The wire name the caller asked for.
    pub expected: &'static str,
    /// The wire name actually held.
    pub found: &'static str,
}
