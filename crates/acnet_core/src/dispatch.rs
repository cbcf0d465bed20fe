//! Opcode dispatch and the public surface an upper layer drives a session
//! through (§4.8): a mapping from a 32-bit opcode to a typed decoder and
//! its subscribers, plus the five operations (`Connect`, `Send`,
//! `OnMessage`, `Disconnect`, `SessionEvents`) everything else in this
//! crate exists to support.
//!
//! What an opcode's payload actually *means* belongs to the game-state
//! layer (§1 Non-goals); this module only gets a message's bytes to the
//! handler that asked for that opcode, decoding them with whatever
//! [`octs::Decode`] impl that handler registered.

use std::{any::Any, sync::Arc};

use ahash::AHashMap;
use octs::Decode;

use crate::{composite::CompositeFieldError, error::Unsupported};

/// A message opcode, as carried by [`crate::framing::FragmentHeader::message_id`].
pub type Opcode = u32;

/// Synthetic opcode [`Dispatcher::dispatch`] is called with for a delivered
/// `LoginRequest`/`WorldLoginRequest` payload. Those packets carry their
/// payload directly after the optional-header block rather than as a
/// fragment with a real `message_id` (§6.4), so there is no wire opcode to
/// dispatch on; this value stands in for one so login deliveries still go
/// through the same dispatch path as every other reassembled message.
pub const LOGIN_OPCODE: Opcode = 0;

/// A message decoded to a concrete type, or left opaque because no decoder
/// was registered for its opcode.
pub enum DecodedMessage {
    /// Decoded to the type the opcode's registered decoder produces.
    Known {
        /// The opcode that was decoded.
        opcode: Opcode,
        /// The decoded value, type-erased; a subscriber registered for
        /// this opcode knows the concrete type and downcasts it.
        value: Arc<dyn Any + Send + Sync>,
    },
    /// No decoder was registered for this opcode; delivered to the default
    /// handler verbatim.
    Unknown {
        /// The opcode that had no registered decoder.
        opcode: Opcode,
        /// Raw payload bytes.
        bytes: Vec<u8>,
    },
}

/// A failure decoding a known opcode's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The registered decoder rejected the bytes.
    #[error("opcode {opcode:#x} failed to decode: {source}")]
    Decode {
        /// Opcode whose decoder failed.
        opcode: Opcode,
        /// The underlying field-level error.
        source: CompositeFieldError,
    },
}

type BoxedDecoder = Box<dyn Fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>, CompositeFieldError> + Send + Sync>;
type BoxedSubscriber = Box<dyn Fn(&DecodedMessage) + Send + Sync>;

/// Builds a type-erased decoder closure for a concrete `T: Decode`, for
/// registration in a [`Dispatcher`].
pub fn decoder_for<T>() -> BoxedDecoder
where
    T: Decode + Send + Sync + 'static,
{
    Box::new(|bytes: &[u8]| {
        let mut cursor = crate::composite::FieldCursor::new(bytes);
        let value = cursor.read::<T>("<dispatch root>")?;
        Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>)
    })
}

/// Holds every registered opcode decoder and subscriber, and the single
/// default handler for opcodes nobody registered for.
#[derive(Default)]
pub struct Dispatcher {
    decoders: AHashMap<Opcode, BoxedDecoder>,
    subscribers: AHashMap<Opcode, Vec<BoxedSubscriber>>,
    default_handler: Option<BoxedSubscriber>,
}

impl Dispatcher {
    /// Builds an empty dispatcher: every opcode is unknown until
    /// registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed decoder for `opcode`. Replaces any previously
    /// registered decoder for the same opcode.
    pub fn register_decoder(&mut self, opcode: Opcode, decoder: BoxedDecoder) {
        self.decoders.insert(opcode, decoder);
    }

    /// Subscribes `handler` to every message delivered for `opcode`,
    /// decoded or not. Multiple subscribers for the same opcode all run,
    /// in registration order.
    pub fn subscribe(&mut self, opcode: Opcode, handler: BoxedSubscriber) {
        self.subscribers.entry(opcode).or_default().push(handler);
    }

    /// Registers the handler invoked for any opcode with neither a decoder
    /// nor a subscriber.
    pub fn set_default_handler(&mut self, handler: BoxedSubscriber) {
        self.default_handler = Some(handler);
    }

    /// Decodes `bytes` for `opcode` (if a decoder is registered) and fans
    /// the result out to every matching subscriber, falling back to the
    /// default handler if neither a decoder nor a subscriber is registered.
    pub fn dispatch(&self, opcode: Opcode, bytes: &[u8]) -> Result<(), DispatchError> {
        let message = match self.decoders.get(&opcode) {
            Some(decode) => {
                let value = decode(bytes).map_err(|source| DispatchError::Decode { opcode, source })?;
                DecodedMessage::Known { opcode, value }
            }
            None => DecodedMessage::Unknown { opcode, bytes: bytes.to_vec() },
        };

        match self.subscribers.get(&opcode) {
            Some(handlers) if !handlers.is_empty() => {
                for handler in handlers {
                    handler(&message);
                }
            }
            _ => {
                if let Some(handler) = &self.default_handler {
                    handler(&message);
                } else {
                    return Err(DispatchError::Decode {
                        opcode,
                        source: CompositeFieldError { field: "<no handler>", offset: 0 },
                    });
                }
            }
        }
        Ok(())
    }

    /// `true` iff a decoder is registered for `opcode`; used by callers
    /// that want to distinguish "unsupported" from "decode failed" (§4.8,
    /// [`Unsupported`]).
    #[must_use]
    pub fn has_decoder(&self, opcode: Opcode) -> bool {
        self.decoders.contains_key(&opcode)
    }
}

/// Returns [`Unsupported`] for an opcode with no registered decoder,
/// without attempting to decode or dispatch it.
pub fn require_known(dispatcher: &Dispatcher, opcode: Opcode) -> Result<(), Unsupported> {
    if dispatcher.has_decoder(opcode) {
        Ok(())
    } else {
        Err(Unsupported(opcode))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn unknown_opcode_reaches_default_handler() {
        let received = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);
        let mut dispatcher = Dispatcher::new();
        dispatcher.set_default_handler(Box::new(move |msg| {
            if let DecodedMessage::Unknown { opcode, bytes } = msg {
                *received_clone.lock().unwrap() = Some((*opcode, bytes.clone()));
            }
        }));

        dispatcher.dispatch(0xABCD, &[1, 2, 3]).unwrap();
        let got = received.lock().unwrap().clone().unwrap();
        assert_eq!(got, (0xABCD, vec![1, 2, 3]));
    }

    #[test]
    fn known_opcode_decodes_and_notifies_subscriber() {
        let received = Arc::new(Mutex::new(None::<u32>));
        let received_clone = Arc::clone(&received);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register_decoder(1, decoder_for::<u32>());
        dispatcher.subscribe(
            1,
            Box::new(move |msg| {
                if let DecodedMessage::Known { value, .. } = msg {
                    if let Some(v) = value.downcast_ref::<u32>() {
                        *received_clone.lock().unwrap() = Some(*v);
                    }
                }
            }),
        );

        dispatcher.dispatch(1, &0x1122_3344u32.to_le_bytes()).unwrap();
        assert_eq!(*received.lock().unwrap(), Some(0x1122_3344));
    }

    #[test]
    fn has_decoder_distinguishes_unsupported() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_decoder(5, decoder_for::<u32>());
        assert!(require_known(&dispatcher, 5).is_ok());
        assert_eq!(require_known(&dispatcher, 6).unwrap_err(), Unsupported(6));
    }
}
