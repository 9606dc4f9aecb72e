//! Host-side bindings for the source runtime's generic enums.
//!
//! Values of source runtime types live in host storage, but only the source runtime knows how to
//! manipulate them. Every copy, move, destroy, and case test goes through the type's witness
//! table; every call goes through the `Bridge`, which decides how each argument crosses over.

pub mod config;
pub use self::config::{Config, ConfigError, PointerAuthConfig};

pub mod abi;
pub use self::abi::{AbiClass, DirectLayout, DirectValue};

pub mod cell;
pub use self::cell::{CellState, OpaqueCell, Projected};

pub mod adapter;
pub use self::adapter::{Arg, Bridge, InstallError, Ret};

pub mod symbols;

pub mod source;
pub use self::source::{take_transcript, construct_tracks_deinit, StructForEnum, TracksDeinit};

pub mod genopt;
pub use self::genopt::{
    Cases, GenericOpt,
    make_generic_opt, make_concrete_opt,
    take_generic_opt, take_concrete_opt,
    inout_generic_opt, inout_concrete_opt,
};
