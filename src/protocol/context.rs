//! Request context: caller-supplied metadata that rides ahead of the payload
//! in every request frame, plus a process-local deadline.
// (c) 2025 Ross Younger

use std::collections::BTreeMap;
use std::time::Instant;

use crate::protocol::pack::bits_to_bytes;
use crate::protocol::{BitRead, BitWrite, Codec, ReaderView, Writer};
use crate::{Error, Result};

/// An ordered mapping from string key to opaque octets, carried on the wire
/// with every request, plus an optional deadline which is not.
///
/// Values are encoded with the codec at `put` time and decoded at `get` time;
/// the wire sees only length-prefixed octet strings.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: BTreeMap<String, Vec<u8>>,
    deadline: Option<Instant>,
}

impl Context {
    /// An empty context with no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Set the instant after which calls made with this context stop waiting.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// The deadline, if one is set.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put<T: Codec>(&mut self, key: &str, value: &T) {
        let mut writer = Writer::with_capacity(bits_to_bytes(value.bit_size()));
        value.serialize(&mut writer);
        let _ = self.values.insert(key.to_string(), writer.into_bytes());
    }

    /// Convenience for string values.
    pub fn put_str(&mut self, key: &str, value: &str) {
        self.put(key, &value.to_string());
    }

    /// Store raw octets under `key` as-is.
    pub fn put_bytes(&mut self, key: &str, value: Vec<u8>) {
        let _ = self.values.insert(key.to_string(), value);
    }

    /// Decode the value stored under `key`.
    pub fn get<T: Codec>(&self, key: &str) -> Result<T> {
        let bytes = self
            .values
            .get(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        let mut reader = ReaderView::new(bytes);
        T::deserialize(&mut reader)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl Codec for Context {
    fn bit_size(&self) -> u32 {
        self.values.bit_size()
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        self.values.serialize(writer);
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            values: BTreeMap::deserialize(reader)?,
            deadline: None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::Context;
    use crate::protocol::{Codec, Reader, Writer};
    use crate::Error;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    #[test]
    fn typed_values_round_trip_through_the_wire_form() {
        let mut input = Context::background();
        input.put_str("key1", "value1");
        input.put("answer", &42u32);

        let mut writer = Writer::with_capacity(crate::protocol::pack::bits_to_bytes(
            input.bit_size(),
        ));
        input.serialize(&mut writer);
        let mut reader = Reader::new(writer.into_bytes());
        let output = Context::deserialize(&mut reader).unwrap();

        assert_eq!(output.get::<String>("key1").unwrap(), "value1");
        assert_eq!(output.get::<u32>("answer").unwrap(), 42);
    }

    #[test]
    fn missing_key() {
        let ctx = Context::background();
        assert_eq!(
            ctx.get::<u32>("absent").unwrap_err(),
            Error::KeyNotFound("absent".into())
        );
    }

    #[test]
    fn deadline_is_not_encoded() {
        let mut ctx = Context::background();
        ctx.set_deadline(Instant::now() + Duration::from_secs(5));
        assert!(ctx.deadline().is_some());
        assert_eq!(ctx.bit_size(), Context::background().bit_size());
    }
}
