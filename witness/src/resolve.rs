//! Metadata resolution and caching.

use core::any::{self, TypeId};
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr;

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::metadata::{Category, MetadataBuilder, MetadataHandle, MetadataRequest, MetadataResponse};
use crate::vwt::ValueWitnessTable;
use crate::{OpaquePtr, FatalError, fatal};

/// A host type that can be used as a generic argument across the bridge.
///
/// # Safety
///
/// `CATEGORY` must be accurate: `Trivial` types must be plain bytes with no drop glue, and
/// `RefCounted` types must be handles whose `clone()` only retains a shared referent. Custom
/// `instantiate_metadata()` implementations must return metadata whose layout and witnesses match
/// `Self`.
pub unsafe trait Payload : Clone + 'static {
    const CATEGORY: Category;

    /// The type's name, as shown in metadata.
    fn type_name() -> String {
        short_type_name::<Self>()
    }

    /// Metadata of this type's generic arguments.
    fn generic_arguments() -> Vec<MetadataHandle> {
        vec![]
    }

    /// Builds this type's metadata.
    ///
    /// Called by `resolve()` the first time the type is used; don't call it directly.
    fn instantiate_metadata(_request: MetadataRequest) -> Result<MetadataResponse, FatalError> {
        let metadata = MetadataBuilder::new(Self::type_name(), Self::CATEGORY, ValueWitnessTable::of::<Self>())
                                       .generic_args(Self::generic_arguments())
                                       .publish();
        Ok(MetadataResponse::complete(metadata))
    }

    /// Writes a printable rendering of the value.
    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&Self::type_name())
    }

    /// Shortcut for `resolve::<Self>()`.
    #[inline]
    fn metadata() -> MetadataHandle {
        resolve::<Self>()
    }
}

/// Strips module paths and generic arguments from a type name.
pub fn short_type_name<T: ?Sized>() -> String {
    let full = any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}

struct TypeCache {
    entries: RwLock<HashMap<TypeId, MetadataHandle>>,
}

fn type_cache() -> &'static TypeCache {
    static CACHE: OnceLock<TypeCache> = OnceLock::new();
    CACHE.get_or_init(|| TypeCache { entries: RwLock::new(HashMap::new()) })
}

/// Resolves the metadata of a host type.
///
/// The first resolution instantiates the metadata; subsequent resolutions return the same handle.
/// Aborts if metadata can't be produced.
pub fn resolve<T: Payload>() -> MetadataHandle {
    let id = TypeId::of::<T>();
    let cache = type_cache();

    if let Some(metadata) = cache.entries.read().unwrap_or_else(PoisonError::into_inner).get(&id) {
        return *metadata;
    }

    // Not holding the lock, as instantiation resolves our generic arguments.
    let response = T::instantiate_metadata(MetadataRequest::COMPLETE)
                     .unwrap_or_else(|err| fatal(err));

    let mut entries = cache.entries.write().unwrap_or_else(PoisonError::into_inner);
    *entries.entry(id).or_insert(response.value)
}

/// Instantiation cache for the metadata of one generic type.
#[derive(Debug)]
pub struct GenericCache {
    descriptor: &'static str,
    entries: RwLock<HashMap<Vec<MetadataHandle>, MetadataHandle>>,
}

impl GenericCache {
    pub fn new(descriptor: &'static str) -> Self {
        Self {
            descriptor,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Gets the metadata for `args`, building it with `f` if this is the first request.
    pub fn instantiate<F>(&self, args: &[MetadataHandle], f: F) -> Result<MetadataHandle, FatalError>
        where F: FnOnce(&[MetadataHandle]) -> Result<MetadataBuilder, FatalError>
    {
        if let Some(metadata) = self.entries.read().unwrap_or_else(PoisonError::into_inner).get(args) {
            return Ok(*metadata);
        }

        let metadata = f(args)?.publish();
        log::debug!("instantiated {} for {:?}", self.descriptor, args);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(*entries.entry(args.to_vec()).or_insert(metadata))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Reconstructs an owned host value from type-erased storage, according to its category.
///
/// Trivial values are byte-copied, values go through their take witness, and ref-counted handles
/// are retained then released from `src`. Either way `src` is left uninitialized.
///
/// # Safety
///
/// `src` must point to a valid `T` described by `metadata`, which the caller gives up ownership
/// of.
pub unsafe fn reconstruct<T: Payload>(src: OpaquePtr, metadata: MetadataHandle) -> T {
    let mut dst = MaybeUninit::<T>::uninit();
    let vwt = metadata.witnesses();

    match T::CATEGORY {
        Category::Trivial => {
            ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr() as *mut u8, vwt.size);
        },
        Category::Value => {
            vwt.initialize_with_take(dst.as_mut_ptr() as OpaquePtr, src, metadata);
        },
        Category::RefCounted => {
            let retained = (*(src as *const T)).clone();
            vwt.destroy(src, metadata);
            return retained;
        },
    }
    dst.assume_init()
}
