//! The bencode codec.
//!
//! Bencode is the only encoding BitTorrent speaks on the wire and on disk:
//! metafiles, tracker responses, resume records and the tracker's state
//! file all use it.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` |
//! | Byte string | `<length>:<data>` | `4:spam` |
//! | List | `l<items>e` | `l4:spami42ee` |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` |
//!
//! The decoder is strict: leading zeros, `-0`, unsorted or duplicate
//! dictionary keys and trailing bytes are all rejected with
//! [`MalformedEncoding`]. [`decode_sloppy`] tolerates trailing bytes and
//! keys in any order, for what trackers send us and for files that may have
//! been padded on disk.
//!
//! Typed metafile parsing stays on `bendy`'s `FromBencode` in
//! [`crate::metainfo`]. This codec is for untyped values: tracker replies
//! and the tracker's own answers, resume records, the tracker's state file,
//! and rewrites of a metafile that must not disturb the `info` dictionary.
//!
//! Frequently sent dictionaries can be encoded once into a [`Bencached`]
//! and embedded into larger values without being re-encoded.
mod decode;
mod encode;
mod value;

pub use decode::{decode, decode_sloppy, MalformedEncoding};
pub use encode::{encode, encode_into};
pub use value::{Bencached, Value};
