//! Type-preserving conversion between source values and the portable format.
//!
//! Three layers:
//! - [`decode_native`] turns a raw payload (Firestore typed fields or plain
//!   JSON) into a [`FieldValue`];
//! - [`serialize`] / [`deserialize`] convert between [`FieldValue`] and the
//!   tagged [`SerializedValue`], losslessly in both directions;
//! - [`to_json`] / [`from_json`] embed a [`SerializedValue`] in JSON for
//!   the on-disk record files.

mod json;
mod native;
mod value;

pub use json::{from_json, to_json, TYPE_TAG};
pub use native::{canonical_document_path, decode_native, decode_typed, NativeFormat};
pub use value::{deserialize, serialize, FieldValue, Number, SerializedValue, Timestamp};
