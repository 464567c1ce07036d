//! Compile-time-reflected, endian-fixed, packed binary layout for on-disk
//! structures.
//!
//! Every user type that wants to live on disk implements [`StaticLayout`],
//! either by hand or via the [`binary_format!`] macro, which plays the role
//! of the `get_binary_format()` / `make_binary_format()` reflection idiom:
//! it lists a type's fields in their intended on-disk order and lets the
//! rest of the crate derive encoding, decoding, size and per-field offsets
//! from that list. Fixed-width integers are big-endian; booleans are one
//! byte; structs, arrays and tuples are the concatenation of their
//! elements' encodings with no padding and no alignment.

use once_cell::sync::OnceCell;

/// A type with a fixed, compile-time-known, on-disk byte layout.
///
/// `SIZE` must be identical for every value of the type; `write_layout` must
/// write exactly `SIZE` bytes and `read_layout` must consume exactly `SIZE`
/// bytes, such that `read_layout(&buf[..SIZE])` round-trips every value
/// written by `write_layout`.
pub trait StaticLayout: Sized {
    /// The number of bytes this type occupies on disk.
    const SIZE: usize;

    /// Writes `self` to `buf`, which must be exactly `SIZE` bytes long.
    fn write_layout(&self, buf: &mut [u8]);

    /// Reads a value back from `buf`, which must be exactly `SIZE` bytes
    /// long. Does not validate semantic invariants of the resulting value;
    /// reading past the end of a too-short buffer is a precondition
    /// violation (checked with `debug_assert!` where cheap to do so).
    fn read_layout(buf: &[u8]) -> Self;

    /// Convenience: serializes into a freshly allocated buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        self.write_layout(&mut buf);
        buf
    }
}

/// Describes one field of a [`binary_format!`]-generated struct: its
/// declared name, its byte offset within the struct, and its encoded size.
/// Used by typed addresses to perform zero-copy member projection
/// (`serialized_offset<&T::m>()` in the original design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// The field's name as written in the struct definition.
    pub name: &'static str,
    /// Byte offset of the field within the serialized struct.
    pub offset: usize,
    /// Encoded size of the field, in bytes.
    pub size: usize,
}

macro_rules! impl_layout_for_uint {
    ($($t:ty),* $(,)?) => {
        $(
            impl StaticLayout for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn write_layout(&self, buf: &mut [u8]) {
                    debug_assert!(buf.len() >= Self::SIZE, "buffer too small for {}", stringify!($t));
                    buf[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
                }

                fn read_layout(buf: &[u8]) -> Self {
                    debug_assert!(buf.len() >= Self::SIZE, "buffer too small for {}", stringify!($t));
                    let mut bytes = [0u8; Self::SIZE];
                    bytes.copy_from_slice(&buf[..Self::SIZE]);
                    <$t>::from_be_bytes(bytes)
                }
            }
        )*
    };
}

impl_layout_for_uint!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl StaticLayout for bool {
    const SIZE: usize = 1;

    fn write_layout(&self, buf: &mut [u8]) {
        buf[0] = if *self { 0x01 } else { 0x00 };
    }

    fn read_layout(buf: &[u8]) -> Self {
        buf[0] != 0x00
    }
}

impl<T: StaticLayout, const N: usize> StaticLayout for [T; N] {
    const SIZE: usize = T::SIZE * N;

    fn write_layout(&self, buf: &mut [u8]) {
        for (i, item) in self.iter().enumerate() {
            item.write_layout(&mut buf[i * T::SIZE..(i + 1) * T::SIZE]);
        }
    }

    fn read_layout(buf: &[u8]) -> Self {
        std::array::from_fn(|i| T::read_layout(&buf[i * T::SIZE..(i + 1) * T::SIZE]))
    }
}

impl<A: StaticLayout, B: StaticLayout> StaticLayout for (A, B) {
    const SIZE: usize = A::SIZE + B::SIZE;

    fn write_layout(&self, buf: &mut [u8]) {
        self.0.write_layout(&mut buf[..A::SIZE]);
        self.1.write_layout(&mut buf[A::SIZE..A::SIZE + B::SIZE]);
    }

    fn read_layout(buf: &[u8]) -> Self {
        (
            A::read_layout(&buf[..A::SIZE]),
            B::read_layout(&buf[A::SIZE..A::SIZE + B::SIZE]),
        )
    }
}

/// Declares a struct together with its [`StaticLayout`] implementation.
///
/// Mirrors `get_binary_format()` / `make_binary_format()`: the fields are
/// listed exactly once, in the order they should be encoded in. The macro
/// generates the struct itself, the concatenating encode/decode pair, and a
/// lazily built [`FieldDescriptor`] table used for member projection
/// (`T::offset_of("field")`).
///
/// ```ignore
/// binary_format! {
///     struct Anchor {
///         counter: u32,
///         root: BlockIndex,
///     }
/// }
/// ```
#[macro_export]
macro_rules! binary_format {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        $vis struct $name {
            $( $(#[$fmeta])* pub $field : $fty ),*
        }

        impl $crate::serialize::StaticLayout for $name {
            const SIZE: usize = 0usize $( + <$fty as $crate::serialize::StaticLayout>::SIZE )*;

            fn write_layout(&self, buf: &mut [u8]) {
                #[allow(unused_mut, unused_variables)]
                let mut offset = 0usize;
                $(
                    {
                        let size = <$fty as $crate::serialize::StaticLayout>::SIZE;
                        $crate::serialize::StaticLayout::write_layout(&self.$field, &mut buf[offset..offset + size]);
                        offset += size;
                    }
                )*
                let _ = offset;
            }

            fn read_layout(buf: &[u8]) -> Self {
                #[allow(unused_mut, unused_variables)]
                let mut offset = 0usize;
                $(
                    let $field = {
                        let size = <$fty as $crate::serialize::StaticLayout>::SIZE;
                        let value = <$fty as $crate::serialize::StaticLayout>::read_layout(&buf[offset..offset + size]);
                        offset += size;
                        value
                    };
                )*
                let _ = offset;
                Self { $($field),* }
            }
        }

        impl $name {
            /// Returns the field table (name, offset, size) in declared order.
            pub fn fields() -> &'static [$crate::serialize::FieldDescriptor] {
                static FIELDS: ::once_cell::sync::OnceCell<Vec<$crate::serialize::FieldDescriptor>> =
                    ::once_cell::sync::OnceCell::new();
                FIELDS.get_or_init(|| {
                    #[allow(unused_mut)]
                    let mut offset = 0usize;
                    #[allow(unused_mut)]
                    let mut out = Vec::new();
                    $(
                        {
                            let size = <$fty as $crate::serialize::StaticLayout>::SIZE;
                            out.push($crate::serialize::FieldDescriptor {
                                name: stringify!($field),
                                offset,
                                size,
                            });
                            offset += size;
                        }
                    )*
                    out
                })
            }

            /// Returns the byte offset of the named field, if it exists.
            pub fn offset_of(field: &str) -> Option<usize> {
                Self::fields().iter().find(|f| f.name == field).map(|f| f.offset)
            }
        }

        impl $crate::address::HasFieldOffsets for $name {
            fn offset_of(field: &str) -> Option<usize> {
                Self::offset_of(field)
            }
        }
    };
}

/// A thin wrapper used by custom encodings (e.g. the allocator's `Extent`,
/// which packs a flag bit into the high bit of its size field) to opt out
/// of the field-wise default and supply their own `StaticLayout`
/// implementation by hand. Kept as a marker so the override is visible at
/// the type's definition site rather than buried in a manual trait impl.
pub trait CustomLayout: StaticLayout {}

#[allow(dead_code)]
fn _unused(_: OnceCell<()>) {}

#[cfg(test)]
mod tests {
    use super::*;

    binary_format! {
        struct Pair {
            a: u32,
            b: u64,
        }
    }

    #[test]
    fn round_trip() {
        let p = Pair { a: 7, b: 99 };
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), Pair::SIZE);
        let back = Pair::read_layout(&bytes);
        assert_eq!(p, back);
    }

    #[test]
    fn size_is_sum_of_fields() {
        assert_eq!(Pair::SIZE, u32::SIZE + u64::SIZE);
    }

    #[test]
    fn field_offsets() {
        assert_eq!(Pair::offset_of("a"), Some(0));
        assert_eq!(Pair::offset_of("b"), Some(4));
        assert_eq!(Pair::offset_of("missing"), None);
    }

    #[test]
    fn member_offset_matches_sub_slice() {
        let p = Pair { a: 0xdead_beef, b: 0x1122_3344_5566_7788 };
        let bytes = p.to_bytes();
        let off = Pair::offset_of("b").unwrap();
        let sub = &bytes[off..off + u64::SIZE];
        assert_eq!(sub, &p.b.to_be_bytes());
    }

    #[test]
    fn array_layout() {
        let a: [u16; 3] = [1, 2, 3];
        let bytes = a.to_bytes();
        assert_eq!(bytes.len(), 6);
        assert_eq!(<[u16; 3]>::read_layout(&bytes), a);
    }

    #[test]
    fn bool_layout() {
        assert_eq!(true.to_bytes(), vec![0x01]);
        assert_eq!(false.to_bytes(), vec![0x00]);
        assert_eq!(bool::read_layout(&[0x01]), true);
    }
}
