use std::sync::Arc;

use bytes::Bytes;

/// The unit exchanged between producers and consumers.
///
/// The transport does not interpret the payload; it is responsible only for
/// delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Name of the destination the message was sent to.
    pub destination: Arc<str>,

    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    pub fn new(destination: impl Into<Arc<str>>, payload: Bytes) -> Self {
        Self {
            destination: destination.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn message_keeps_destination_and_payload() {
        // ---
        let message = Message::new("orders.q", Bytes::from_static(b"body"));
        let copy = message.clone();

        assert_eq!(&*copy.destination, "orders.q");
        assert_eq!(copy.payload, Bytes::from_static(b"body"));
        assert_eq!(copy, message);
    }
}
