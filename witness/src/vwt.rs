//! Value witness tables.

use core::cmp;
use core::fmt;
use core::mem;
use core::ptr;

use std::alloc::Layout;

use crate::{ConstOpaquePtr, OpaquePtr, MetadataHandle, Payload, Category, FatalError, fatal};

bitflags::bitflags! {
    pub struct WitnessFlags: u32 {
        const NON_POD               = 0b0001;
        const NON_BITWISE_TAKABLE   = 0b0010;
        const HAS_ENUM_WITNESSES    = 0b0100;
    }
}

pub type CopyFn = unsafe fn(dest: OpaquePtr, src: ConstOpaquePtr, metadata: MetadataHandle) -> OpaquePtr;
pub type TakeFn = unsafe fn(dest: OpaquePtr, src: OpaquePtr, metadata: MetadataHandle) -> OpaquePtr;
pub type DestroyFn = unsafe fn(obj: OpaquePtr, metadata: MetadataHandle);
pub type DescribeFn = unsafe fn(obj: ConstOpaquePtr, metadata: MetadataHandle, f: &mut fmt::Formatter) -> fmt::Result;

/// Per-type table of the operations needed to manipulate a value whose type is erased.
///
/// Every operation takes the metadata of the type it's operating on, so that generic types can
/// share one set of functions across all their instantiations.
#[derive(Clone, Copy)]
pub struct ValueWitnessTable {
    pub initialize_with_copy: CopyFn,
    pub assign_with_copy: CopyFn,
    pub initialize_with_take: TakeFn,
    pub assign_with_take: TakeFn,
    pub destroy: DestroyFn,
    pub describe: DescribeFn,

    pub size: usize,
    pub stride: usize,
    pub align: usize,
    pub flags: WitnessFlags,

    pub enum_witnesses: Option<EnumWitnesses>,
}

/// Additional witnesses implemented by enum types.
#[derive(Clone, Copy)]
pub struct EnumWitnesses {
    pub get_enum_tag: unsafe fn(obj: ConstOpaquePtr, metadata: MetadataHandle) -> u32,

    /// Prepares the payload for extraction; afterwards the enum no longer owns it.
    pub destructive_project_enum_data: unsafe fn(obj: OpaquePtr, metadata: MetadataHandle),

    /// Sets the tag; any payload must already be initialized.
    pub destructive_inject_enum_tag: unsafe fn(obj: OpaquePtr, tag: u32, metadata: MetadataHandle),
}

impl fmt::Debug for ValueWitnessTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ValueWitnessTable")
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("align", &self.align)
            .field("flags", &self.flags)
            .field("is_enum", &self.enum_witnesses.is_some())
            .finish()
    }
}

/// Computes the stride of a type: its size rounded up to alignment, and never zero.
pub fn stride_of(size: usize, align: usize) -> usize {
    let rounded = (size + align - 1) & !(align - 1);
    cmp::max(rounded, 1)
}

impl ValueWitnessTable {
    /// Creates the table for a host type.
    pub fn of<T: Payload>() -> Self {
        let mut flags = WitnessFlags::empty();
        if T::CATEGORY != Category::Trivial {
            flags |= WitnessFlags::NON_POD;
        }

        Self {
            initialize_with_copy: typed::initialize_with_copy::<T>,
            assign_with_copy: typed::assign_with_copy::<T>,
            initialize_with_take: typed::initialize_with_take::<T>,
            assign_with_take: typed::assign_with_take::<T>,
            destroy: typed::destroy::<T>,
            describe: typed::describe::<T>,

            size: mem::size_of::<T>(),
            stride: stride_of(mem::size_of::<T>(), mem::align_of::<T>()),
            align: mem::align_of::<T>(),
            flags,

            enum_witnesses: None,
        }
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        Layout::from_size_align(self.size, self.align)
               .unwrap_or_else(|_| unreachable!("witness table with invalid layout"))
    }

    #[inline]
    pub fn is_pod(&self) -> bool {
        !self.flags.contains(WitnessFlags::NON_POD)
    }

    #[inline]
    pub fn is_bitwise_takable(&self) -> bool {
        !self.flags.contains(WitnessFlags::NON_BITWISE_TAKABLE)
    }

    /// Copies `src` into uninitialized `dest`.
    ///
    /// # Safety
    ///
    /// `src` must be a valid value of the type described by `metadata`; `dest` must be valid for
    /// writes of that type.
    #[inline]
    pub unsafe fn copy_into(&self, dest: OpaquePtr, src: ConstOpaquePtr, metadata: MetadataHandle) -> OpaquePtr {
        (self.initialize_with_copy)(dest, src, metadata)
    }

    /// Moves `src` into uninitialized `dest`, leaving `src` uninitialized.
    ///
    /// # Safety
    ///
    /// As `copy_into()`; `src` must not be used again.
    #[inline]
    pub unsafe fn initialize_with_take(&self, dest: OpaquePtr, src: OpaquePtr, metadata: MetadataHandle) -> OpaquePtr {
        (self.initialize_with_take)(dest, src, metadata)
    }

    /// Destroys `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a valid value of the type described by `metadata`, and is uninitialized
    /// afterwards.
    #[inline]
    pub unsafe fn destroy(&self, obj: OpaquePtr, metadata: MetadataHandle) {
        (self.destroy)(obj, metadata)
    }

    /// Gets the enum witnesses, aborting if this isn't an enum.
    pub fn enum_witnesses(&self, metadata: MetadataHandle) -> &EnumWitnesses {
        match &self.enum_witnesses {
            Some(enum_witnesses) => enum_witnesses,
            None => fatal(FatalError::NotAnEnum(metadata.name().to_owned())),
        }
    }
}

/// Witnesses for statically known host types.
mod typed {
    use super::*;

    pub unsafe fn initialize_with_copy<T: Clone>(dest: OpaquePtr, src: ConstOpaquePtr, _: MetadataHandle) -> OpaquePtr {
        let src = &*(src as *const T);
        (dest as *mut T).write(src.clone());
        dest
    }

    pub unsafe fn assign_with_copy<T: Clone>(dest: OpaquePtr, src: ConstOpaquePtr, _: MetadataHandle) -> OpaquePtr {
        if dest as ConstOpaquePtr != src {
            (*(dest as *mut T)).clone_from(&*(src as *const T));
        }
        dest
    }

    pub unsafe fn initialize_with_take<T>(dest: OpaquePtr, src: OpaquePtr, _: MetadataHandle) -> OpaquePtr {
        ptr::copy_nonoverlapping(src as *const T, dest as *mut T, 1);
        dest
    }

    pub unsafe fn assign_with_take<T>(dest: OpaquePtr, src: OpaquePtr, _: MetadataHandle) -> OpaquePtr {
        ptr::drop_in_place(dest as *mut T);
        ptr::copy_nonoverlapping(src as *const T, dest as *mut T, 1);
        dest
    }

    pub unsafe fn destroy<T>(obj: OpaquePtr, _: MetadataHandle) {
        ptr::drop_in_place(obj as *mut T)
    }

    pub unsafe fn describe<T: Payload>(obj: ConstOpaquePtr, _: MetadataHandle, f: &mut fmt::Formatter) -> fmt::Result {
        (*(obj as *const T)).describe(f)
    }
}
