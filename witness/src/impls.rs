use core::fmt;

use std::rc::Rc;
use std::sync::Arc;

use crate::{Category, MetadataHandle, Payload};
use crate::resolve::short_type_name;

/// Implements `Payload` for plain-old-data types.
///
/// The types must be `Copy`.
#[macro_export]
macro_rules! trivial_payload {
    ($($t:ty),* $(,)?) => {
        $(
            const _: fn() = || {
                fn assert_copy<T: Copy>() {}
                assert_copy::<$t>();
            };

            unsafe impl $crate::Payload for $t {
                const CATEGORY: $crate::Category = $crate::Category::Trivial;

                fn describe(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                    ::core::fmt::Debug::fmt(self, f)
                }
            }
        )*
    }
}

/// Implements `Payload` for value types, copied with `Clone`.
#[macro_export]
macro_rules! value_payload {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl $crate::Payload for $t {
                const CATEGORY: $crate::Category = $crate::Category::Value;

                fn describe(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                    ::core::fmt::Debug::fmt(self, f)
                }
            }
        )*
    }
}

trivial_payload!(u8, u16, u32, u64, usize,
                 i8, i16, i32, i64, isize,
                 f32, f64, bool, char, ());

value_payload!(String);

unsafe impl<T: Payload> Payload for Vec<T> {
    const CATEGORY: Category = Category::Value;

    fn type_name() -> String {
        format!("Vec<{}>", T::metadata().name())
    }

    fn generic_arguments() -> Vec<MetadataHandle> {
        vec![T::metadata()]
    }

    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("[")?;
        for (i, item) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            item.describe(f)?;
        }
        f.write_str("]")
    }
}

// Shared handles behave like class references: their metadata is named after the referent, and
// they describe themselves by that name.

unsafe impl<T: 'static> Payload for Rc<T> {
    const CATEGORY: Category = Category::RefCounted;

    fn type_name() -> String {
        short_type_name::<T>()
    }
}

unsafe impl<T: 'static> Payload for Arc<T> {
    const CATEGORY: Category = Category::RefCounted;

    fn type_name() -> String {
        short_type_name::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{resolve, ConstOpaquePtr};

    fn describe<T: Payload>(value: &T) -> String {
        unsafe { resolve::<T>().describe(value as *const T as ConstOpaquePtr).to_string() }
    }

    #[derive(Debug)]
    struct TracksDeinit;

    #[test]
    fn descriptions() {
        assert_eq!(describe(&7u16), "7");
        assert_eq!(describe(&true), "true");
        assert_eq!(describe(&String::from("hi")), "\"hi\"");
        assert_eq!(describe(&vec![1u8, 2, 3]), "[1, 2, 3]");
        assert_eq!(describe(&Rc::new(TracksDeinit)), "TracksDeinit");
        assert_eq!(describe(&Arc::new(TracksDeinit)), "TracksDeinit");
    }

    #[test]
    fn categories() {
        assert_eq!(resolve::<f64>().category(), Category::Trivial);
        assert_eq!(resolve::<String>().category(), Category::Value);
        assert_eq!(resolve::<Vec<u8>>().category(), Category::Value);
        assert_eq!(resolve::<Rc<TracksDeinit>>().category(), Category::RefCounted);
        assert_eq!(resolve::<Rc<TracksDeinit>>().name(), "TracksDeinit");

        assert!(resolve::<()>().witnesses().is_pod());
        assert_eq!(resolve::<()>().witnesses().size, 0);
        assert_eq!(resolve::<()>().witnesses().stride, 1);
    }
}
