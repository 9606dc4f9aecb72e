//! Runtime type metadata.

use core::fmt;
use core::hash;
use core::ops;
use core::ptr;

use std::alloc::Layout;

use static_assertions::{assert_eq_size, assert_impl_all};

use crate::ptrauth::{self, VALUE_WITNESS_DISCRIMINATOR};
use crate::vwt::ValueWitnessTable;
use crate::{ConstOpaquePtr, FatalError, fatal};

/// How a value of a type is reconstructed on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Plain bytes; copies are bitwise.
    Trivial,

    /// Copies go through the copy witness.
    Value,

    /// A shared handle; copying it retains the referent.
    RefCounted,
}

/// Layout information for enum types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumInfo {
    /// Case names, in tag order. Payload-bearing cases come first.
    pub cases: &'static [&'static str],

    /// Number of cases with a payload.
    pub payload_cases: u32,

    /// Offset of the tag byte.
    pub tag_offset: usize,
}

impl EnumInfo {
    pub fn case_name(&self, tag: u32) -> Option<&'static str> {
        self.cases.get(tag as usize).copied()
    }

    pub fn has_payload(&self, tag: u32) -> bool {
        tag < self.payload_cases
    }
}

/// Type metadata.
///
/// Only ever exists behind a `MetadataHandle`: metadata is created with a `MetadataBuilder` and is
/// immutable once published.
pub struct TypeMetadata {
    name: String,
    category: Category,

    /// Signed pointer to the `ValueWitnessTable`.
    witnesses: u64,

    generic_args: Vec<MetadataHandle>,
    enum_info: Option<EnumInfo>,
}

/// Shared handle to published type metadata.
#[derive(Clone, Copy)]
pub struct MetadataHandle(&'static TypeMetadata);

assert_eq_size!(MetadataHandle, *const ());
assert_impl_all!(MetadataHandle: Send, Sync);

impl TypeMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn generic_args(&self) -> &[MetadataHandle] {
        &self.generic_args
    }

    /// Authenticates and returns the value witness table.
    pub fn witnesses(&self) -> &'static ValueWitnessTable {
        let storage = &self.witnesses as *const u64 as usize;
        match ptrauth::scheme().authenticate(self.witnesses, storage, VALUE_WITNESS_DISCRIMINATOR) {
            Some(addr) => unsafe { &*(addr as *const ValueWitnessTable) },
            None => fatal(FatalError::WitnessAuth(self.name.clone())),
        }
    }

    pub fn layout(&self) -> Layout {
        self.witnesses().layout()
    }

    pub fn enum_info(&self) -> &EnumInfo {
        match &self.enum_info {
            Some(info) => info,
            None => fatal(FatalError::NotAnEnum(self.name.clone())),
        }
    }

    pub fn is_enum(&self) -> bool {
        self.enum_info.is_some()
    }
}

impl MetadataHandle {
    /// Gets a generic argument, aborting if there isn't one at `index`.
    pub fn generic_argument(self, index: usize) -> MetadataHandle {
        match self.0.generic_args.get(index) {
            Some(arg) => *arg,
            None => fatal(FatalError::MissingGenericArgument { ty: self.0.name.clone(), index }),
        }
    }

    /// Returns a `Display` rendering of a value of this type.
    ///
    /// # Safety
    ///
    /// `obj` must point to a valid value of this type for as long as the return value is used.
    pub unsafe fn describe(self, obj: ConstOpaquePtr) -> Describe {
        Describe { obj, metadata: self }
    }

    pub fn as_ptr(self) -> *const TypeMetadata {
        self.0
    }
}

impl ops::Deref for MetadataHandle {
    type Target = TypeMetadata;

    #[inline(always)]
    fn deref(&self) -> &TypeMetadata {
        self.0
    }
}

impl PartialEq for MetadataHandle {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}
impl Eq for MetadataHandle {}

impl hash::Hash for MetadataHandle {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        (self.0 as *const TypeMetadata as usize).hash(state)
    }
}

impl fmt::Debug for MetadataHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MetadataHandle({} @ {:p})", self.0.name, self.0)
    }
}

/// Value rendered via its describe witness.
pub struct Describe {
    obj: ConstOpaquePtr,
    metadata: MetadataHandle,
}

impl fmt::Display for Describe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        unsafe { (self.metadata.witnesses().describe)(self.obj, self.metadata, f) }
    }
}

/// Metadata under construction.
#[derive(Debug)]
pub struct MetadataBuilder {
    name: String,
    category: Category,
    witnesses: ValueWitnessTable,
    generic_args: Vec<MetadataHandle>,
    enum_info: Option<EnumInfo>,
}

impl MetadataBuilder {
    pub fn new(name: impl Into<String>, category: Category, witnesses: ValueWitnessTable) -> Self {
        Self {
            name: name.into(),
            category,
            witnesses,
            generic_args: vec![],
            enum_info: None,
        }
    }

    pub fn generic_args(mut self, args: Vec<MetadataHandle>) -> Self {
        self.generic_args = args;
        self
    }

    pub fn enum_info(mut self, info: EnumInfo) -> Self {
        self.enum_info = Some(info);
        self
    }

    /// Publishes the metadata, signing its witness table pointer.
    ///
    /// Published metadata lives for the rest of the process.
    pub fn publish(self) -> MetadataHandle {
        let witnesses: &'static ValueWitnessTable = Box::leak(Box::new(self.witnesses));

        let metadata: &'static mut TypeMetadata = Box::leak(Box::new(TypeMetadata {
            name: self.name,
            category: self.category,
            witnesses: 0,
            generic_args: self.generic_args,
            enum_info: self.enum_info,
        }));

        let storage = &metadata.witnesses as *const u64 as usize;
        let raw = witnesses as *const ValueWitnessTable as usize;
        metadata.witnesses = match ptrauth::scheme().sign(raw, storage, VALUE_WITNESS_DISCRIMINATOR) {
            Some(signed) => signed,
            None => fatal(FatalError::WitnessAuth(metadata.name.clone())),
        };

        log::debug!("published metadata for {} ({:?})", metadata.name, witnesses);
        MetadataHandle(metadata)
    }
}

/// The state a metadata request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataState {
    Complete,
    NonTransitiveComplete,
    LayoutComplete,
    Abstract,
}

/// Request code passed to a metadata accessor.
///
/// The low byte is the requested `MetadataState`; bit 8 marks a non-blocking request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataRequest(pub usize);

impl MetadataRequest {
    pub const COMPLETE: Self = MetadataRequest(0);

    const NON_BLOCKING: usize = 0x100;

    pub fn new(state: MetadataState, blocking: bool) -> Self {
        let code = match state {
            MetadataState::Complete => 0x00,
            MetadataState::NonTransitiveComplete => 0x01,
            MetadataState::LayoutComplete => 0x3f,
            MetadataState::Abstract => 0xff,
        };
        MetadataRequest(if blocking { code } else { code | Self::NON_BLOCKING })
    }

    pub fn state(self) -> Result<MetadataState, FatalError> {
        if self.0 & !(Self::NON_BLOCKING | 0xff) != 0 {
            return Err(FatalError::InvalidRequest(self.0));
        }
        match self.0 & 0xff {
            0x00 => Ok(MetadataState::Complete),
            0x01 => Ok(MetadataState::NonTransitiveComplete),
            0x3f => Ok(MetadataState::LayoutComplete),
            0xff => Ok(MetadataState::Abstract),
            _ => Err(FatalError::InvalidRequest(self.0)),
        }
    }

    pub fn is_blocking(self) -> bool {
        self.0 & Self::NON_BLOCKING == 0
    }
}

/// Response from a metadata accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataResponse {
    pub value: MetadataHandle,
    pub state: MetadataState,
}

impl MetadataResponse {
    pub fn complete(value: MetadataHandle) -> Self {
        Self { value, state: MetadataState::Complete }
    }
}
