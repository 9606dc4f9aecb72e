//! Heap storage for type-erased values.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;

use std::alloc::{self, Layout};

use witness::{ConstOpaquePtr, OpaquePtr, MetadataHandle, Payload, FatalError, fatal, reconstruct};

/// Lifecycle of an `OpaqueCell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// Allocated, holding no value.
    Uninit,

    /// Holding exactly one value, which the cell owns.
    Live,

    /// The value was moved out; the cell no longer owns it.
    Consumed,

    /// The value was destroyed in place.
    Destroyed,
}

/// An owning, metadata-sized buffer holding one type-erased value.
///
/// The storage is released on drop. If the cell is still live its value is destroyed first; in
/// every other state the cell owns nothing, and nothing is destroyed.
pub struct OpaqueCell {
    ptr: NonNull<u8>,
    metadata: MetadataHandle,
    state: CellState,
}

impl OpaqueCell {
    /// Allocates zero-filled storage for a value of the type described by `metadata`.
    pub fn allocate(metadata: MetadataHandle) -> Self {
        let layout = metadata.layout();

        let ptr = if layout.size() > 0 {
            let ptr = unsafe { alloc::alloc_zeroed(layout) };
            NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout))
        } else {
            // Zero-sized, so any well aligned non-null pointer works.
            unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
        };

        Self {
            ptr,
            metadata,
            state: CellState::Uninit,
        }
    }

    /// Creates a live cell holding a copy of `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid value of the type described by `metadata`.
    pub unsafe fn copy_of(metadata: MetadataHandle, src: ConstOpaquePtr) -> Self {
        let mut this = Self::allocate(metadata);
        metadata.witnesses().copy_into(this.ptr.as_ptr(), src, metadata);
        this.state = CellState::Live;
        this
    }

    /// Creates a live cell by moving the value out of `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid value of the type described by `metadata`, which is
    /// uninitialized afterwards.
    pub unsafe fn take_from(metadata: MetadataHandle, src: OpaquePtr) -> Self {
        let mut this = Self::allocate(metadata);
        metadata.witnesses().initialize_with_take(this.ptr.as_ptr(), src, metadata);
        this.state = CellState::Live;
        this
    }

    /// Initializes an uninitialized cell in place.
    ///
    /// # Safety
    ///
    /// `f` must fully initialize a valid value of the cell's type.
    pub unsafe fn initialize_with(&mut self, f: impl FnOnce(OpaquePtr)) {
        if self.state != CellState::Uninit {
            fatal(FatalError::UseAfterConsume(self.metadata.name().to_owned()))
        }
        f(self.ptr.as_ptr());
        self.state = CellState::Live;
    }

    #[inline]
    pub fn metadata(&self) -> MetadataHandle {
        self.metadata
    }

    #[inline]
    pub fn state(&self) -> CellState {
        self.state
    }

    #[inline]
    fn assert_live(&self) {
        if self.state != CellState::Live {
            fatal(FatalError::UseAfterConsume(self.metadata.name().to_owned()))
        }
    }

    /// Gets a pointer to the live value.
    pub fn as_ptr(&self) -> ConstOpaquePtr {
        self.assert_live();
        self.ptr.as_ptr()
    }

    /// Gets a mutable pointer to the live value.
    pub fn as_mut_ptr(&mut self) -> OpaquePtr {
        self.assert_live();
        self.ptr.as_ptr()
    }

    /// Reads the enum tag.
    pub fn tag(&self) -> u32 {
        let ptr = self.as_ptr();
        let vwt = self.metadata.witnesses();
        unsafe { (vwt.enum_witnesses(self.metadata).get_enum_tag)(ptr, self.metadata) }
    }

    /// Destroys the value in place.
    ///
    /// Aborts unless the cell is live: a value is destroyed exactly once.
    pub fn destroy(&mut self) {
        if self.state != CellState::Live {
            fatal(FatalError::DoubleDestroy(self.metadata.name().to_owned()))
        }
        unsafe {
            self.metadata.witnesses().destroy(self.ptr.as_ptr(), self.metadata);
        }
        self.state = CellState::Destroyed;
    }

    /// Moves the whole value out of the cell as a host value.
    pub fn into_value<T: Payload>(mut self) -> T {
        check_metadata::<T>(self.metadata);
        let ptr = self.as_mut_ptr();
        self.state = CellState::Consumed;
        unsafe { reconstruct::<T>(ptr, self.metadata) }
    }

    /// Destructively projects the payload out of an enum value.
    ///
    /// Consumes the cell: afterwards the enum no longer owns its payload, and the returned
    /// `Projected` is responsible for it. Aborts if the current case has no payload.
    pub fn destructive_project(mut self) -> Projected {
        let tag = self.tag();
        let info = self.metadata.enum_info();
        if !info.has_payload(tag) {
            fatal(FatalError::ProjectWithoutPayload {
                ty: self.metadata.name().to_owned(),
                case: info.case_name(tag).unwrap_or("?").to_owned(),
            })
        }

        let ptr = self.as_mut_ptr();
        unsafe {
            let enum_witnesses = self.metadata.witnesses().enum_witnesses(self.metadata);
            (enum_witnesses.destructive_project_enum_data)(ptr, self.metadata);
        }
        self.state = CellState::Consumed;

        Projected {
            payload: self.metadata.generic_argument(0),
            cell: ManuallyDrop::new(self),
            taken: false,
        }
    }
}

fn check_metadata<T: Payload>(metadata: MetadataHandle) {
    let expected = T::metadata();
    if expected != metadata {
        fatal(FatalError::LayoutMismatch {
            ty: expected.name().to_owned(),
            expected: expected.name().to_owned(),
            got: metadata.name().to_owned(),
        })
    }
}

impl Drop for OpaqueCell {
    fn drop(&mut self) {
        if self.state == CellState::Live {
            self.destroy();
        }

        let layout: Layout = self.metadata.layout();
        if layout.size() > 0 {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

impl fmt::Debug for OpaqueCell {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("OpaqueCell");
        s.field("metadata", &self.metadata)
         .field("state", &self.state);
        if self.state == CellState::Live {
            s.field("value", &format_args!("{}", unsafe { self.metadata.describe(self.ptr.as_ptr()) }));
        }
        s.finish()
    }
}

/// A payload projected out of an enum cell.
///
/// Owns both the payload and the storage it lives in. Dropping a `Projected` without taking the
/// payload destroys it.
pub struct Projected {
    cell: ManuallyDrop<OpaqueCell>,
    payload: MetadataHandle,
    taken: bool,
}

impl Projected {
    pub fn payload_metadata(&self) -> MetadataHandle {
        self.payload
    }

    /// Pointer to the payload.
    pub fn payload_ptr(&mut self) -> OpaquePtr {
        if self.taken {
            fatal(FatalError::UseAfterConsume(self.payload.name().to_owned()))
        }
        // Payloads live at offset zero.
        self.cell.ptr.as_ptr()
    }

    /// Takes the payload as a host value.
    pub fn into_value<T: Payload>(mut self) -> T {
        check_metadata::<T>(self.payload);
        let ptr = self.payload_ptr();
        self.taken = true;
        unsafe { reconstruct::<T>(ptr, self.payload) }
    }
}

impl Drop for Projected {
    fn drop(&mut self) {
        if !self.taken {
            let ptr = self.payload_ptr();
            unsafe { self.payload.witnesses().destroy(ptr, self.payload) }
        }
        // The cell is consumed, so dropping it only frees the storage.
        unsafe { ManuallyDrop::drop(&mut self.cell) }
    }
}

impl fmt::Debug for Projected {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Projected")
            .field("payload", &self.payload)
            .field("taken", &self.taken)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    use witness::resolve;

    use crate::genopt::GenericOpt;

    #[derive(Clone, Debug)]
    struct CountDrops(Rc<Cell<usize>>);

    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    witness::value_payload!(CountDrops);

    #[test]
    fn allocate_zeroed() {
        let cell = OpaqueCell::allocate(resolve::<u64>());
        assert_eq!(cell.state(), CellState::Uninit);
        assert_eq!(unsafe { *(cell.ptr.as_ptr() as *const u64) }, 0);
    }

    #[test]
    fn zero_sized() {
        let mut cell = unsafe { OpaqueCell::copy_of(resolve::<()>(), &() as *const () as ConstOpaquePtr) };
        assert_eq!(cell.state(), CellState::Live);
        cell.destroy();
        assert_eq!(cell.state(), CellState::Destroyed);
    }

    #[test]
    fn copy_and_destroy_once() {
        let drops = Rc::new(Cell::new(0));
        let orig = CountDrops(drops.clone());

        let cell = unsafe { OpaqueCell::copy_of(resolve::<CountDrops>(), &orig as *const _ as ConstOpaquePtr) };
        assert_eq!(Rc::strong_count(&drops), 3);
        drop(cell);
        assert_eq!(drops.get(), 1);

        let mut cell = unsafe { OpaqueCell::copy_of(resolve::<CountDrops>(), &orig as *const _ as ConstOpaquePtr) };
        cell.destroy();
        assert_eq!(drops.get(), 2);
        drop(cell);
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn into_value() {
        let mut s = ManuallyDrop::new(String::from("moved"));
        let cell = unsafe { OpaqueCell::take_from(resolve::<String>(), &mut *s as *mut String as OpaquePtr) };
        assert_eq!(format!("{:?}", cell),
                   format!("OpaqueCell {{ metadata: {:?}, state: Live, value: \"moved\" }}", resolve::<String>()));

        let s: String = cell.into_value();
        assert_eq!(s, "moved");
    }

    #[test]
    fn project() {
        let drops = Rc::new(Cell::new(0));
        let opt = GenericOpt::some(CountDrops(drops.clone()));
        let metadata = GenericOpt::<CountDrops>::metadata();

        let cell = unsafe { OpaqueCell::copy_of(metadata, opt.as_opaque()) };
        assert_eq!(cell.tag(), 0);

        let projected = cell.destructive_project();
        assert_eq!(projected.payload_metadata(), resolve::<CountDrops>());
        let value: CountDrops = projected.into_value();
        assert_eq!(drops.get(), 0);

        drop(value);
        assert_eq!(drops.get(), 1);
        drop(opt);
        assert_eq!(drops.get(), 2);
    }

    #[test]
    fn projected_without_take_destroys_payload() {
        let drops = Rc::new(Cell::new(0));
        let opt = GenericOpt::some(CountDrops(drops.clone()));

        let cell = unsafe { OpaqueCell::copy_of(GenericOpt::<CountDrops>::metadata(), opt.as_opaque()) };
        drop(cell.destructive_project());
        assert_eq!(drops.get(), 1);
        assert_eq!(Rc::strong_count(&drops), 2);
    }
}
