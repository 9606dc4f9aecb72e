//! Runtime type metadata and value witness tables.
//!
//! Code on the far side of the bridge never knows the concrete types it manipulates. Instead every
//! type argument is described by a `MetadataHandle`, whose value witness table knows how to copy,
//! move, destroy, and describe values of that type given only an opaque pointer.

mod error;
pub use self::error::{FatalError, fatal};

pub mod ptrauth;

pub mod vwt;
pub use self::vwt::{ValueWitnessTable, EnumWitnesses, WitnessFlags};

pub mod metadata;
pub use self::metadata::{
    Category, EnumInfo, TypeMetadata, MetadataHandle, MetadataBuilder,
    MetadataRequest, MetadataResponse, MetadataState,
};

mod resolve;
pub use self::resolve::{Payload, GenericCache, resolve, reconstruct, short_type_name};

mod impls;

/// Pointer to a value whose type is only known through its metadata.
pub type OpaquePtr = *mut u8;

/// Read-only `OpaquePtr`.
pub type ConstOpaquePtr = *const u8;
