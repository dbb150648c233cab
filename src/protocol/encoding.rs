//! Codec dispatch: every encodable type implements [`Codec`] (size compute,
//! serialize, deserialize) and composites are wired up with
//! [`impl_codec!`](crate::impl_codec) / [`codec_enum!`](crate::codec_enum).
// (c) 2025 Ross Younger

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use crate::protocol::pack::{
    var_decode_int, var_decode_uint, var_encode_int, var_encode_uint, var_int_bit_size,
    var_uint_bit_size,
};
use crate::protocol::{BitRead, BitWrite, Writer};
use crate::{Error, Result};

/// Wire coding for a value type.
///
/// The three operations agree by contract: `serialize` produces exactly
/// `bit_size` bits, and `deserialize` reverses it for every in-contract
/// value. Framing code relies on the first property to pre-size writers.
pub trait Codec: Sized {
    /// Encoded size of `self` in bits.
    fn bit_size(&self) -> u32;

    /// Append the wire form of `self` to `writer`.
    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W);

    /// Decode a value from `reader`, advancing its cursor.
    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self>;
}

impl Codec for bool {
    fn bit_size(&self) -> u32 {
        1
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        writer.write_bits(u8::from(*self), 1);
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(reader.read_bits(1)? != 0)
    }
}

impl Codec for u8 {
    fn bit_size(&self) -> u32 {
        8
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        writer.write_byte(*self);
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        reader.read_byte()
    }
}

impl Codec for i8 {
    fn bit_size(&self) -> u32 {
        8
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        #[allow(clippy::cast_sign_loss)]
        writer.write_byte(*self as u8);
    }

    #[allow(clippy::cast_possible_wrap)]
    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(reader.read_byte()? as i8)
    }
}

macro_rules! impl_codec_varuint {
    ($($ty:ty => $width:expr),* $(,)?) => {
        $(
            impl Codec for $ty {
                fn bit_size(&self) -> u32 {
                    var_uint_bit_size(u64::from(*self), $width)
                }

                fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
                    var_encode_uint(writer, u64::from(*self), $width);
                }

                #[allow(clippy::cast_possible_truncation)]
                fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
                    Ok(var_decode_uint(reader, $width)? as $ty)
                }
            }
        )*
    };
}

macro_rules! impl_codec_varint {
    ($($ty:ty => $width:expr),* $(,)?) => {
        $(
            impl Codec for $ty {
                fn bit_size(&self) -> u32 {
                    var_int_bit_size(i64::from(*self), $width)
                }

                fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
                    var_encode_int(writer, i64::from(*self), $width);
                }

                #[allow(clippy::cast_possible_truncation)]
                fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
                    Ok(var_decode_int(reader, $width)? as $ty)
                }
            }
        )*
    };
}

impl_codec_varuint! {
    u16 => 2,
    u32 => 4,
    u64 => 8,
}

impl_codec_varint! {
    i16 => 2,
    i32 => 4,
    i64 => 8,
}

impl Codec for f32 {
    fn bit_size(&self) -> u32 {
        32
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        writer.write_bytes(&self.to_bits().to_be_bytes());
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; 4];
        reader.read_bytes(&mut bytes)?;
        Ok(Self::from_bits(u32::from_be_bytes(bytes)))
    }
}

impl Codec for f64 {
    fn bit_size(&self) -> u32 {
        64
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        writer.write_bytes(&self.to_bits().to_be_bytes());
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; 8];
        reader.read_bytes(&mut bytes)?;
        Ok(Self::from_bits(u64::from_be_bytes(bytes)))
    }
}

impl Codec for String {
    fn bit_size(&self) -> u32 {
        (self.len() as u32).bit_size() + (self.len() as u32) * 8
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        (self.len() as u32).serialize(writer);
        writer.write_bytes(self.as_bytes());
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = u32::deserialize(reader)? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_bytes(&mut bytes)?;
        Self::from_utf8(bytes).map_err(|e| Error::InvalidEncoding(e.to_string()))
    }
}

impl<T: Codec> Codec for Vec<T> {
    fn bit_size(&self) -> u32 {
        let mut size = (self.len() as u32).bit_size();
        for item in self {
            size += item.bit_size();
        }
        size
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        (self.len() as u32).serialize(writer);
        for item in self {
            item.serialize(writer);
        }
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = u32::deserialize(reader)? as usize;
        let mut value = Self::with_capacity(len.min(4096));
        for _ in 0..len {
            value.push(T::deserialize(reader)?);
        }
        Ok(value)
    }
}

impl<T: Codec + Ord> Codec for BTreeSet<T> {
    fn bit_size(&self) -> u32 {
        let mut size = (self.len() as u32).bit_size();
        for item in self {
            size += item.bit_size();
        }
        size
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        (self.len() as u32).serialize(writer);
        for item in self {
            item.serialize(writer);
        }
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = u32::deserialize(reader)?;
        let mut value = Self::new();
        for _ in 0..len {
            let _ = value.insert(T::deserialize(reader)?);
        }
        Ok(value)
    }
}

impl<T: Codec + Eq + Hash> Codec for HashSet<T> {
    fn bit_size(&self) -> u32 {
        let mut size = (self.len() as u32).bit_size();
        for item in self {
            size += item.bit_size();
        }
        size
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        (self.len() as u32).serialize(writer);
        for item in self {
            item.serialize(writer);
        }
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = u32::deserialize(reader)?;
        let mut value = Self::new();
        for _ in 0..len {
            let _ = value.insert(T::deserialize(reader)?);
        }
        Ok(value)
    }
}

impl<K: Codec + Ord, V: Codec> Codec for BTreeMap<K, V> {
    fn bit_size(&self) -> u32 {
        let mut size = (self.len() as u32).bit_size();
        for (k, v) in self {
            size += k.bit_size() + v.bit_size();
        }
        size
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        (self.len() as u32).serialize(writer);
        for (k, v) in self {
            k.serialize(writer);
            v.serialize(writer);
        }
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = u32::deserialize(reader)?;
        let mut value = Self::new();
        for _ in 0..len {
            let k = K::deserialize(reader)?;
            let v = V::deserialize(reader)?;
            let _ = value.insert(k, v);
        }
        Ok(value)
    }
}

impl<K: Codec + Eq + Hash, V: Codec> Codec for HashMap<K, V> {
    fn bit_size(&self) -> u32 {
        let mut size = (self.len() as u32).bit_size();
        for (k, v) in self {
            size += k.bit_size() + v.bit_size();
        }
        size
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        (self.len() as u32).serialize(writer);
        for (k, v) in self {
            k.serialize(writer);
            v.serialize(writer);
        }
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let len = u32::deserialize(reader)?;
        let mut value = Self::new();
        for _ in 0..len {
            let k = K::deserialize(reader)?;
            let v = V::deserialize(reader)?;
            let _ = value.insert(k, v);
        }
        Ok(value)
    }
}

impl<T: Codec, const N: usize> Codec for [T; N] {
    fn bit_size(&self) -> u32 {
        self.iter().map(Codec::bit_size).sum()
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        for item in self {
            item.serialize(writer);
        }
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut vec = Vec::with_capacity(N);
        for _ in 0..N {
            vec.push(T::deserialize(reader)?);
        }
        match vec.try_into() {
            Ok(array) => Ok(array),
            Err(_) => unreachable!("vec length is N by construction"),
        }
    }
}

/// The wire error value: an optional message string, where the empty string
/// means "no error".
impl Codec for Option<Error> {
    fn bit_size(&self) -> u32 {
        match self {
            Some(e) => e.to_string().bit_size(),
            None => String::new().bit_size(),
        }
    }

    fn serialize<W: BitWrite + ?Sized>(&self, writer: &mut W) {
        match self {
            Some(e) => e.to_string().serialize(writer),
            None => String::new().serialize(writer),
        }
    }

    fn deserialize<R: BitRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let msg = String::deserialize(reader)?;
        Ok(if msg.is_empty() {
            None
        } else {
            Some(Error::Remote(msg))
        })
    }
}

/// Object-safe facade over [`Codec`] for code that handles messages without
/// knowing their concrete type (the middleware chain, chiefly).
///
/// Blanket-implemented for every `'static` codec type; downcast through
/// [`Message::as_any`] to recover the concrete value.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    /// Encoded size of the message body in bits.
    fn body_bits(&self) -> u32;

    /// Append the message body to `writer`.
    fn write_body(&self, writer: &mut Writer);

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl<T> Message for T
where
    T: Codec + fmt::Debug + Send + Sync + 'static,
{
    fn body_bits(&self) -> u32 {
        self.bit_size()
    }

    fn write_body(&self, writer: &mut Writer) {
        self.serialize(writer);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Implement [`Codec`] for a braced struct from its ordered field list.
///
/// The wire form is the concatenation of the fields in the order given, which
/// must match their declaration order. An empty field list yields a zero-bit
/// encoding. Derived composites are expressed by listing the base composite
/// as the first field.
///
/// ```
/// use bitrpc::impl_codec;
///
/// #[derive(Debug, Clone, PartialEq, Default)]
/// pub struct Sample {
///     pub id: u32,
///     pub name: String,
/// }
/// impl_codec!(Sample { id, name });
/// ```
#[macro_export]
macro_rules! impl_codec {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::protocol::Codec for $ty {
            fn bit_size(&self) -> u32 {
                0 $(+ $crate::protocol::Codec::bit_size(&self.$field))*
            }

            #[allow(unused_variables)]
            fn serialize<W: $crate::protocol::BitWrite + ?Sized>(&self, writer: &mut W) {
                $($crate::protocol::Codec::serialize(&self.$field, writer);)*
            }

            #[allow(unused_variables)]
            fn deserialize<R: $crate::protocol::BitRead + ?Sized>(
                reader: &mut R,
            ) -> $crate::Result<Self> {
                Ok(Self {
                    $($field: $crate::protocol::Codec::deserialize(reader)?,)*
                })
            }
        }
    };
}

/// Declare an open enum backed by `u16` with named well-known values.
///
/// Enums travel as u16 varuints; discriminants outside the named set
/// deserialize successfully and compare/round-trip by their raw value, so
/// validation stays with the caller.
///
/// ```
/// use bitrpc::codec_enum;
///
/// codec_enum! {
///     /// Message severity.
///     pub struct Severity {
///         INFO = 1,
///         WARNING = 2,
///     }
/// }
/// assert_eq!(Severity::INFO.0, 1);
/// ```
#[macro_export]
macro_rules! codec_enum {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        $vis struct $name(pub u16);

        impl $name {
            $(
                $(#[$vmeta])*
                $vis const $variant: Self = Self($value);
            )*
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self.0 {
                    $($value => f.write_str(concat!(
                        stringify!($name), "::", stringify!($variant)
                    )),)*
                    other => write!(f, concat!(stringify!($name), "({})"), other),
                }
            }
        }

        impl $crate::protocol::Codec for $name {
            fn bit_size(&self) -> u32 {
                $crate::protocol::Codec::bit_size(&self.0)
            }

            fn serialize<W: $crate::protocol::BitWrite + ?Sized>(&self, writer: &mut W) {
                $crate::protocol::Codec::serialize(&self.0, writer);
            }

            fn deserialize<R: $crate::protocol::BitRead + ?Sized>(
                reader: &mut R,
            ) -> $crate::Result<Self> {
                Ok(Self($crate::protocol::Codec::deserialize(reader)?))
            }
        }
    };
}
