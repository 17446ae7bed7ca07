//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getters and setters for zerocopy struct fields stored as
//! little-endian wrapper types. Used by the node header and the meta page.
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct MetaPage {
//!     root: U64,
//!     nkeys: U16,
//! }
//!
//! impl MetaPage {
//!     zerocopy_accessors! {
//!         root: u64,
//!         nkeys: u16,
//!     }
//! }
//!
//! // pub fn root(&self) -> u64
//! // pub fn set_root(&mut self, val: u64)
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
