//! Mangled symbols of the `Generics` source module.

pub const GENERIC_OPT_METADATA_ACCESSOR: &str = "$s8Generics10GenericOptOMa";

pub const MAKE_GENERIC_OPT: &str = "$s8Generics14makeGenericOptyAA0cD0OyxGxlF";
pub const MAKE_CONCRETE_OPT: &str = "$s8Generics15makeConcreteOptyAA07GenericD0Oys6UInt16VGAFF";
pub const TAKE_GENERIC_OPT: &str = "$s8Generics14takeGenericOptyyAA0cD0OyxGlF";
pub const TAKE_CONCRETE_OPT: &str = "$s8Generics15takeConcreteOptyyAA07GenericD0Oys6UInt16VGF";
pub const INOUT_GENERIC_OPT: &str = "$s8Generics15inoutGenericOptyyAA0cD0OyxGz_xtlF";
pub const INOUT_CONCRETE_OPT: &str = "$s8Generics16inoutConcreteOptyyAA07GenericD0Oys6UInt16VGzF";

pub const METHOD: &str = "$s8Generics10GenericOptO6methodyyF";
pub const RESET: &str = "$s8Generics10GenericOptO5resetyyF";
pub const GENERIC_METHOD: &str = "$s8Generics10GenericOptO13genericMethodyqd__qd__lF";
pub const COMPUTED_PROP: &str = "$s8Generics10GenericOptO12computedPropSivg";
