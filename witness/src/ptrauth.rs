//! Pointer authentication of value witness table pointers.
//!
//! Metadata never stores its witness table pointer in the clear: the pointer is signed against the
//! address of the field holding it, blended with a fixed discriminator, and authenticated on every
//! load. How that signing works is platform specific, so it's a pluggable scheme installed once
//! per process.

use std::fmt;
use std::sync::OnceLock;

use thiserror::Error;

/// Discriminator blended into value witness table pointer signatures.
pub const VALUE_WITNESS_DISCRIMINATOR: u16 = 11839;

/// A pointer signing scheme.
pub trait PointerAuth : Send + Sync + fmt::Debug {
    /// Signs `raw`, stored at address `storage`.
    ///
    /// Returns `None` if the pointer can't be signed under this scheme.
    fn sign(&self, raw: usize, storage: usize, discriminator: u16) -> Option<u64>;

    /// Authenticates a signed pointer, returning the raw pointer on success.
    fn authenticate(&self, signed: u64, storage: usize, discriminator: u16) -> Option<usize>;

    /// Whether pointers are stored as-is.
    fn is_unsigned(&self) -> bool {
        false
    }
}

/// Pointers stored unsigned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoPointerAuth;

impl PointerAuth for NoPointerAuth {
    #[inline(always)]
    fn sign(&self, raw: usize, _: usize, _: u16) -> Option<u64> {
        Some(raw as u64)
    }

    #[inline(always)]
    fn authenticate(&self, signed: u64, _: usize, _: u16) -> Option<usize> {
        Some(signed as usize)
    }

    fn is_unsigned(&self) -> bool {
        true
    }
}

/// Software signing: a keyed 16-bit signature kept in the unused high bits of the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendPointerAuth {
    key: u64,
}

const SIGNATURE_SHIFT: u32 = 48;
const ADDRESS_MASK: u64 = (1 << SIGNATURE_SHIFT) - 1;

impl BlendPointerAuth {
    pub fn new(key: u64) -> Self {
        Self { key }
    }

    /// Blends the storage address with the discriminator.
    fn blend(&self, storage: usize, discriminator: u16) -> u64 {
        (storage as u64 & ADDRESS_MASK) | ((discriminator as u64) << SIGNATURE_SHIFT)
    }

    fn signature(&self, raw: u64, storage: usize, discriminator: u16) -> u64 {
        let mut x = raw ^ self.blend(storage, discriminator).rotate_left(17) ^ self.key;
        x = x.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        x ^= x >> 29;
        x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        (x >> SIGNATURE_SHIFT) & 0xffff
    }
}

impl PointerAuth for BlendPointerAuth {
    fn sign(&self, raw: usize, storage: usize, discriminator: u16) -> Option<u64> {
        let raw = raw as u64;
        if raw & !ADDRESS_MASK != 0 {
            return None;
        }
        Some(raw | (self.signature(raw, storage, discriminator) << SIGNATURE_SHIFT))
    }

    fn authenticate(&self, signed: u64, storage: usize, discriminator: u16) -> Option<usize> {
        let raw = signed & ADDRESS_MASK;
        if signed >> SIGNATURE_SHIFT == self.signature(raw, storage, discriminator) {
            Some(raw as usize)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
#[error("a pointer authentication scheme is already in use")]
pub struct SchemeInstalledError(pub Box<dyn PointerAuth>);

static SCHEME: OnceLock<Box<dyn PointerAuth>> = OnceLock::new();

/// Installs the process-wide scheme.
///
/// Fails once any metadata has been published, as that metadata was signed with whatever scheme
/// was current at the time.
pub fn install(scheme: Box<dyn PointerAuth>) -> Result<(), SchemeInstalledError> {
    SCHEME.set(scheme).map_err(SchemeInstalledError)
}

/// Gets the current scheme, locking in `NoPointerAuth` if none was installed.
pub fn scheme() -> &'static dyn PointerAuth {
    SCHEME.get_or_init(|| Box::new(NoPointerAuth)).as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_auth_roundtrip() {
        let signed = NoPointerAuth.sign(0x1234, 0x8000, VALUE_WITNESS_DISCRIMINATOR).unwrap();
        assert_eq!(signed, 0x1234);
        assert_eq!(NoPointerAuth.authenticate(signed, 0, 0), Some(0x1234));
        assert!(NoPointerAuth.is_unsigned());
        assert!(!BlendPointerAuth::new(1).is_unsigned());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn blend_auth() {
        let auth = BlendPointerAuth::new(0xdead_beef);
        let signed = auth.sign(0x7f00_1234_5678, 0x7f00_0000_1000, VALUE_WITNESS_DISCRIMINATOR).unwrap();

        assert_eq!(auth.authenticate(signed, 0x7f00_0000_1000, VALUE_WITNESS_DISCRIMINATOR),
                   Some(0x7f00_1234_5678));

        // moved to a different address
        assert_eq!(auth.authenticate(signed, 0x7f00_0000_1008, VALUE_WITNESS_DISCRIMINATOR), None);

        // different discriminator
        assert_eq!(auth.authenticate(signed, 0x7f00_0000_1000, 1), None);

        // tampered pointer
        assert_eq!(auth.authenticate(signed ^ 0x10, 0x7f00_0000_1000, VALUE_WITNESS_DISCRIMINATOR), None);

        // different key
        let other = BlendPointerAuth::new(0xcafe);
        assert_eq!(other.authenticate(signed, 0x7f00_0000_1000, VALUE_WITNESS_DISCRIMINATOR), None);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn blend_rejects_wide_pointers() {
        let auth = BlendPointerAuth::new(1);
        assert_eq!(auth.sign(usize::MAX, 0, 0), None);
    }
}
