//! Host-side wrapper for the `GenericOpt<T>` enum.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop, MaybeUninit};

use std::alloc::Layout;

use static_assertions::assert_eq_size;

use witness::{
    ConstOpaquePtr, OpaquePtr, Category, MetadataHandle, MetadataRequest, MetadataResponse, Payload,
    FatalError, fatal, reconstruct, resolve,
};

use crate::adapter::{Arg, Bridge};
use crate::cell::OpaqueCell;
use crate::source::{SOME_TAG, NONE_TAG};
use crate::symbols;

/// The cases of a `GenericOpt`, in tag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cases {
    Some,
    None,
}

/// Same layout as the source runtime's `GenericOpt<T>`.
#[repr(C)]
struct Storage<T> {
    payload: MaybeUninit<T>,
    tag: u8,
}

/// A source runtime `GenericOpt<T>`, stored inline.
///
/// The bytes are owned by the source runtime: everything other than reading the payload goes
/// through the enum's witness table or the bridge.
#[repr(transparent)]
pub struct GenericOpt<T: Payload> {
    storage: MaybeUninit<Storage<T>>,
    marker: PhantomData<T>,
}

assert_eq_size!(GenericOpt<u16>, [u8; 4]);
assert_eq_size!(GenericOpt<()>, u8);
assert_eq_size!(GenericOpt<GenericOpt<u16>>, [u16; 3]);

impl<T: Payload> GenericOpt<T> {
    /// The metadata of `GenericOpt<T>`, as provided by the source runtime.
    pub fn metadata() -> MetadataHandle {
        resolve::<Self>()
    }

    /// Creates a value of type `metadata` initialized by `f`.
    ///
    /// The storage is zeroed first, so padding is never uninitialized. Aborts if `f` leaves an
    /// invalid tag behind.
    ///
    /// # Safety
    ///
    /// `f` must fully initialize a valid `GenericOpt<T>`, and `metadata` must be `Self::metadata()`.
    pub(crate) unsafe fn return_new_value(metadata: MetadataHandle, f: impl FnOnce(OpaquePtr)) -> Self {
        let mut storage = MaybeUninit::<Storage<T>>::zeroed();
        let ptr = storage.as_mut_ptr() as OpaquePtr;
        f(ptr);
        (metadata.witnesses().enum_witnesses(metadata).get_enum_tag)(ptr, metadata);
        Self { storage, marker: PhantomData }
    }

    pub fn some(value: T) -> Self {
        let metadata = Self::metadata();
        let payload = metadata.generic_argument(0);
        let mut value = ManuallyDrop::new(value);

        unsafe {
            Self::return_new_value(metadata, |dest| {
                payload.witnesses().initialize_with_take(dest, &mut *value as *mut T as OpaquePtr, payload);
                inject(dest, SOME_TAG, metadata);
            })
        }
    }

    pub fn none() -> Self {
        let metadata = Self::metadata();
        unsafe {
            Self::return_new_value(metadata, |dest| inject(dest, NONE_TAG, metadata))
        }
    }

    pub fn as_opaque(&self) -> ConstOpaquePtr {
        self.storage.as_ptr() as ConstOpaquePtr
    }

    pub fn as_opaque_mut(&mut self) -> OpaquePtr {
        self.storage.as_mut_ptr() as OpaquePtr
    }

    fn tag(&self) -> u32 {
        let metadata = Self::metadata();
        unsafe {
            (metadata.witnesses().enum_witnesses(metadata).get_enum_tag)(self.as_opaque(), metadata)
        }
    }

    pub fn case(&self) -> Cases {
        match self.tag() {
            SOME_TAG => Cases::Some,
            NONE_TAG => Cases::None,
            tag => fatal(FatalError::InvalidTag { ty: Self::metadata().name().to_owned(), tag }),
        }
    }

    pub fn is_some(&self) -> bool {
        self.case() == Cases::Some
    }

    pub fn is_none(&self) -> bool {
        self.case() == Cases::None
    }

    /// Gets a copy of the payload.
    ///
    /// Aborts if this is `none`.
    pub fn get_some(&self) -> T {
        let cell = unsafe { OpaqueCell::copy_of(Self::metadata(), self.as_opaque()) };
        cell.destructive_project().into_value()
    }

    /// Moves the payload out.
    ///
    /// Aborts if this is `none`.
    pub fn into_some(self) -> T {
        let metadata = Self::metadata();
        if self.is_none() {
            fatal(FatalError::ProjectWithoutPayload {
                ty: metadata.name().to_owned(),
                case: "none".to_owned(),
            })
        }

        let mut this = ManuallyDrop::new(self);
        let ptr = this.as_opaque_mut();
        unsafe {
            (metadata.witnesses().enum_witnesses(metadata).destructive_project_enum_data)(ptr, metadata);
            reconstruct::<T>(ptr, metadata.generic_argument(0))
        }
    }

    /// Borrows the payload, if there is one.
    pub fn payload(&self) -> Option<&T> {
        match self.case() {
            Cases::Some => Some(unsafe { &*(self.as_opaque() as *const T) }),
            Cases::None => None,
        }
    }

    /// Sets this to `none`.
    pub fn reset(&mut self) {
        let metadata = Self::metadata();
        unsafe {
            Bridge::global().call(symbols::RESET, &[
                Arg::Metadata(metadata),
                Arg::InOut(self.as_opaque_mut()),
            ]);
        }
    }

    pub fn method(&self) {
        unsafe {
            Bridge::global().call(symbols::METHOD, &[
                Arg::Metadata(Self::metadata()),
                Arg::Opaque(self.as_opaque()),
            ]);
        }
    }

    pub fn generic_method<U: Payload>(&self, x: &U) -> U {
        let u = U::metadata();

        let mut result = OpaqueCell::allocate(u);
        unsafe {
            result.initialize_with(|dest| {
                Bridge::global().call(symbols::GENERIC_METHOD, &[
                    Arg::Result(dest),
                    Arg::Opaque(x as *const U as ConstOpaquePtr),
                    Arg::Metadata(Self::metadata()),
                    Arg::Metadata(u),
                    Arg::Opaque(self.as_opaque()),
                ]);
            });
        }
        result.into_value()
    }

    pub fn computed_prop(&self) -> isize {
        unsafe {
            Bridge::global().call(symbols::COMPUTED_PROP, &[
                Arg::Metadata(Self::metadata()),
                Arg::Opaque(self.as_opaque()),
            ]).into_int()
        }
    }
}

unsafe fn inject(obj: OpaquePtr, tag: u32, metadata: MetadataHandle) {
    (metadata.witnesses().enum_witnesses(metadata).destructive_inject_enum_tag)(obj, tag, metadata)
}

impl<T: Payload> Drop for GenericOpt<T> {
    fn drop(&mut self) {
        let metadata = Self::metadata();
        unsafe { metadata.witnesses().destroy(self.as_opaque_mut(), metadata) }
    }
}

impl<T: Payload> Clone for GenericOpt<T> {
    fn clone(&self) -> Self {
        let metadata = Self::metadata();
        unsafe {
            Self::return_new_value(metadata, |dest| {
                metadata.witnesses().copy_into(dest, self.as_opaque(), metadata);
            })
        }
    }

    fn clone_from(&mut self, source: &Self) {
        let metadata = Self::metadata();
        unsafe {
            (metadata.witnesses().assign_with_copy)(self.as_opaque_mut(), source.as_opaque(), metadata);
        }
    }
}

impl<T: Payload> fmt::Debug for GenericOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.describe(f)
    }
}

impl<T: Payload + PartialEq> PartialEq for GenericOpt<T> {
    fn eq(&self, other: &Self) -> bool {
        self.payload() == other.payload()
    }
}

unsafe impl<T: Payload> Payload for GenericOpt<T> {
    const CATEGORY: Category = Category::Value;

    fn type_name() -> String {
        format!("GenericOpt<{}>", T::metadata().name())
    }

    fn generic_arguments() -> Vec<MetadataHandle> {
        vec![T::metadata()]
    }

    fn instantiate_metadata(request: MetadataRequest) -> Result<MetadataResponse, FatalError> {
        let response = Bridge::global().request_metadata(symbols::GENERIC_OPT_METADATA_ACCESSOR,
                                                         request, &Self::generic_arguments());
        let metadata = response.value;

        let expected = Layout::new::<Self>();
        if metadata.layout() != expected {
            return Err(FatalError::LayoutMismatch {
                ty: metadata.name().to_owned(),
                expected: format!("{:?}", expected),
                got: format!("{:?}", metadata.layout()),
            });
        }

        let tag_offset = metadata.enum_info().tag_offset;
        if tag_offset != mem::size_of::<T>() {
            return Err(FatalError::LayoutMismatch {
                ty: metadata.name().to_owned(),
                expected: format!("tag at {}", mem::size_of::<T>()),
                got: format!("tag at {}", tag_offset),
            });
        }

        Ok(response)
    }

    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let metadata = Self::metadata();
        fmt::Display::fmt(&unsafe { metadata.describe(self.as_opaque()) }, f)
    }
}

/// Makes `some` of a copy of `x`.
pub fn make_generic_opt<T: Payload>(x: &T) -> GenericOpt<T> {
    let metadata = GenericOpt::<T>::metadata();

    unsafe {
        GenericOpt::return_new_value(metadata, |dest| {
            Bridge::global().call(symbols::MAKE_GENERIC_OPT, &[
                Arg::Result(dest),
                Arg::Opaque(x as *const T as ConstOpaquePtr),
                Arg::Metadata(T::metadata()),
            ]);
        })
    }
}

/// Makes `some(x)`, with `x` passed directly.
pub fn make_concrete_opt(x: u16) -> GenericOpt<u16> {
    let bridge = Bridge::global();
    let metadata = GenericOpt::<u16>::metadata();

    unsafe {
        GenericOpt::return_new_value(metadata, |dest| {
            let ret = bridge.call(symbols::MAKE_CONCRETE_OPT, &[
                Arg::Result(dest),
                bridge.pass_by_value(u16::metadata(), &x as *const u16 as ConstOpaquePtr),
            ]);
            bridge.receive_by_value(metadata, ret, dest)
        })
    }
}

/// Prints `x`.
pub fn take_generic_opt<T: Payload>(x: &GenericOpt<T>) {
    unsafe {
        Bridge::global().call(symbols::TAKE_GENERIC_OPT, &[
            Arg::Opaque(x.as_opaque()),
            Arg::Metadata(T::metadata()),
        ]);
    }
}

pub fn take_concrete_opt(x: &GenericOpt<u16>) {
    let bridge = Bridge::global();
    unsafe {
        bridge.call(symbols::TAKE_CONCRETE_OPT, &[
            bridge.pass_by_value(GenericOpt::<u16>::metadata(), x.as_opaque()),
        ]);
    }
}

/// Swaps between `some` and `none`: `some` becomes `none`, and `none` becomes `some(y)`.
pub fn inout_generic_opt<T: Payload>(x: &mut GenericOpt<T>, y: &T) {
    unsafe {
        Bridge::global().call(symbols::INOUT_GENERIC_OPT, &[
            Arg::InOut(x.as_opaque_mut()),
            Arg::Opaque(y as *const T as ConstOpaquePtr),
            Arg::Metadata(T::metadata()),
        ]);
    }
}

/// Triples the payload of `x`, if any.
///
/// Aborts on overflow.
pub fn inout_concrete_opt(x: &mut GenericOpt<u16>) {
    let bridge = Bridge::global();
    unsafe {
        bridge.call(symbols::INOUT_CONCRETE_OPT, &[
            Arg::InOut(x.as_opaque_mut()),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::rc::Rc;
    use std::sync::Arc;

    use dropcheck::DropCheck;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<GenericOpt<u16>>(), 4);
        assert_eq!(mem::size_of::<GenericOpt<()>>(), 1);
        assert_eq!(mem::size_of::<GenericOpt<u64>>(), 16);
        assert_eq!(GenericOpt::<u16>::metadata().layout(), Layout::new::<GenericOpt<u16>>());
        assert_eq!(GenericOpt::<u16>::metadata().name(), "GenericOpt<u16>");
    }

    #[test]
    fn cases() {
        let some = GenericOpt::some(42u32);
        assert_eq!(some.case(), Cases::Some);
        assert!(some.is_some());
        assert_eq!(some.payload(), Some(&42));

        let none = GenericOpt::<u32>::none();
        assert_eq!(none.case(), Cases::None);
        assert!(none.is_none());
        assert_eq!(none.payload(), None);

        assert_ne!(some, none);
        assert_eq!(some, GenericOpt::some(42));
    }

    #[test]
    fn debug() {
        assert_eq!(format!("{:?}", GenericOpt::some(String::from("x"))), "some(\"x\")");
        assert_eq!(format!("{:?}", GenericOpt::<String>::none()), "none");
        assert_eq!(format!("{:?}", GenericOpt::some(GenericOpt::some(7u16))), "some(some(7))");
    }

    #[test]
    fn get_some() {
        let opt = GenericOpt::some(String::from("payload"));
        assert_eq!(opt.get_some(), "payload");
        assert_eq!(opt.get_some(), "payload");
        assert_eq!(opt.into_some(), "payload");
    }

    #[test]
    fn ref_counted() {
        let shared = Rc::new(5u8);
        let opt = GenericOpt::some(shared.clone());
        assert_eq!(Rc::strong_count(&shared), 2);

        let got = opt.get_some();
        assert!(Rc::ptr_eq(&got, &shared));
        assert_eq!(Rc::strong_count(&shared), 3);

        drop(opt);
        drop(got);
        assert_eq!(Rc::strong_count(&shared), 1);
    }

    #[test]
    fn drop_once() {
        let check = DropCheck::new();
        let (token, state) = check.pair();

        let opt = GenericOpt::some(Arc::new(token));
        let copy = opt.clone();
        drop(opt);
        assert!(state.is_not_dropped());
        drop(copy);
        assert!(state.is_dropped());
    }

    #[test]
    fn clone_from() {
        let mut a = GenericOpt::some(String::from("a"));
        let b = GenericOpt::<String>::none();
        a.clone_from(&b);
        assert!(a.is_none());

        a.clone_from(&GenericOpt::some(String::from("c")));
        assert_eq!(a.payload().map(String::as_str), Some("c"));
    }

    #[test]
    fn computed_prop() {
        assert_eq!(GenericOpt::some(1u8).computed_prop(), 42);
        assert_eq!(GenericOpt::<String>::none().computed_prop(), 42);
    }
}
