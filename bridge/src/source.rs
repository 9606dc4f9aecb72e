//! The `Generics` source module.
//!
//! These are the callee side of the bridge: every function only sees opaque pointers, metadata
//! handles, and directly passed lanes, and manipulates values exclusively through their witness
//! tables.

use core::cell::RefCell;
use core::fmt;
use core::mem;
use core::ptr;

use std::alloc::Layout;
use std::rc::Rc;
use std::sync::OnceLock;

use witness::{
    ConstOpaquePtr, OpaquePtr,
    Category, EnumInfo, EnumWitnesses, GenericCache, MetadataBuilder, MetadataHandle,
    MetadataResponse, Payload, ValueWitnessTable, WitnessFlags,
    FatalError, fatal, resolve,
};
use witness::vwt::stride_of;

use crate::cell::OpaqueCell;
use crate::adapter::{CallFrame, Entry, Function, ParamKind, Ret, RetKind, Signature, SymbolTable};
use crate::symbols;

pub(crate) const SOME_TAG: u32 = 0;
pub(crate) const NONE_TAG: u32 = 1;

/// Log target of `print` output.
pub const PRINT_TARGET: &str = "genopt::source";

thread_local! {
    static TRANSCRIPT: RefCell<Vec<String>> = RefCell::new(vec![]);
}

fn print(line: String) {
    log::info!(target: PRINT_TARGET, "{}", line);
    TRANSCRIPT.with(|transcript| transcript.borrow_mut().push(line));
}

/// Drains the lines printed by the source module on this thread.
pub fn take_transcript() -> Vec<String> {
    TRANSCRIPT.with(|transcript| mem::take(&mut *transcript.borrow_mut()))
}

/// A class that reports its lifetime to the transcript.
pub struct TracksDeinit(());

impl Drop for TracksDeinit {
    fn drop(&mut self) {
        print("destroy-TracksDeinit".to_owned());
    }
}

impl fmt::Debug for TracksDeinit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TracksDeinit")
    }
}

/// Creates a new `TracksDeinit` instance.
pub fn construct_tracks_deinit() -> Rc<TracksDeinit> {
    print("init-TracksDeinit".to_owned());
    Rc::new(TracksDeinit(()))
}

/// A value type holding a class reference.
#[derive(Debug, Clone)]
pub struct StructForEnum {
    pub x: Rc<TracksDeinit>,
}

impl StructForEnum {
    pub fn new() -> Self {
        Self { x: construct_tracks_deinit() }
    }
}

impl Default for StructForEnum {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Payload for StructForEnum {
    const CATEGORY: Category = Category::Value;

    fn describe(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("StructForEnum(x: ")?;
        self.x.describe(f)?;
        f.write_str(")")
    }
}

/// Gets the metadata of `GenericOpt<payload>`.
pub fn generic_opt_metadata(payload: MetadataHandle) -> Result<MetadataHandle, FatalError> {
    static CACHE: OnceLock<GenericCache> = OnceLock::new();
    CACHE.get_or_init(|| GenericCache::new("GenericOpt"))
         .instantiate(&[payload], build_generic_opt)
}

fn generic_opt(payload: MetadataHandle) -> MetadataHandle {
    generic_opt_metadata(payload).unwrap_or_else(|err| fatal(err))
}

fn build_generic_opt(args: &[MetadataHandle]) -> Result<MetadataBuilder, FatalError> {
    let payload = match args {
        [payload] => *payload,
        _ => return Err(FatalError::MetadataUnavailable(format!("GenericOpt with {} arguments", args.len()))),
    };
    let payload_vwt = payload.witnesses();

    // Single payload enum: payload at offset zero, followed by a tag byte.
    let (layout, tag_offset) = payload_vwt.layout()
                                          .extend(Layout::new::<u8>())
                                          .map_err(|_| FatalError::Overflow("GenericOpt layout"))?;
    let layout = layout.pad_to_align();

    let flags = WitnessFlags::HAS_ENUM_WITNESSES
              | (payload_vwt.flags & (WitnessFlags::NON_POD | WitnessFlags::NON_BITWISE_TAKABLE));

    let vwt = ValueWitnessTable {
        initialize_with_copy: erased::initialize_with_copy,
        assign_with_copy: erased::assign_with_copy,
        initialize_with_take: erased::initialize_with_take,
        assign_with_take: erased::assign_with_take,
        destroy: erased::destroy,
        describe: erased::describe,

        size: layout.size(),
        stride: stride_of(layout.size(), layout.align()),
        align: layout.align(),
        flags,

        enum_witnesses: Some(EnumWitnesses {
            get_enum_tag: erased::get_enum_tag,
            destructive_project_enum_data: erased::destructive_project_enum_data,
            destructive_inject_enum_tag: erased::destructive_inject_enum_tag,
        }),
    };

    Ok(MetadataBuilder::new(format!("GenericOpt<{}>", payload.name()), Category::Value, vwt)
                       .generic_args(vec![payload])
                       .enum_info(EnumInfo {
                           cases: &["some", "none"],
                           payload_cases: 1,
                           tag_offset,
                       }))
}

/// Witnesses shared by every `GenericOpt` instantiation.
mod erased {
    use super::*;

    unsafe fn checked_tag(obj: ConstOpaquePtr, metadata: MetadataHandle) -> u32 {
        let info = metadata.enum_info();
        let tag = *obj.add(info.tag_offset) as u32;
        if info.case_name(tag).is_none() {
            fatal(FatalError::InvalidTag { ty: metadata.name().to_owned(), tag })
        }
        tag
    }

    pub unsafe fn get_enum_tag(obj: ConstOpaquePtr, metadata: MetadataHandle) -> u32 {
        checked_tag(obj, metadata)
    }

    pub unsafe fn destructive_project_enum_data(_obj: OpaquePtr, _metadata: MetadataHandle) {
        // The payload already lives at offset zero, and the tag byte doesn't overlap it.
    }

    pub unsafe fn destructive_inject_enum_tag(obj: OpaquePtr, tag: u32, metadata: MetadataHandle) {
        let info = metadata.enum_info();
        if info.case_name(tag).is_none() {
            fatal(FatalError::InvalidTag { ty: metadata.name().to_owned(), tag })
        }
        *obj.add(info.tag_offset) = tag as u8;
    }

    pub unsafe fn initialize_with_copy(dest: OpaquePtr, src: ConstOpaquePtr, metadata: MetadataHandle) -> OpaquePtr {
        let vwt = metadata.witnesses();
        if vwt.is_pod() {
            ptr::copy_nonoverlapping(src, dest, vwt.size);
            return dest;
        }

        let tag = checked_tag(src, metadata);
        if metadata.enum_info().has_payload(tag) {
            let payload = metadata.generic_argument(0);
            payload.witnesses().copy_into(dest, src, payload);
        }
        destructive_inject_enum_tag(dest, tag, metadata);
        dest
    }

    pub unsafe fn assign_with_copy(dest: OpaquePtr, src: ConstOpaquePtr, metadata: MetadataHandle) -> OpaquePtr {
        if dest as ConstOpaquePtr != src {
            destroy(dest, metadata);
            initialize_with_copy(dest, src, metadata);
        }
        dest
    }

    pub unsafe fn initialize_with_take(dest: OpaquePtr, src: OpaquePtr, metadata: MetadataHandle) -> OpaquePtr {
        let vwt = metadata.witnesses();
        if vwt.is_bitwise_takable() {
            ptr::copy_nonoverlapping(src as ConstOpaquePtr, dest, vwt.size);
            return dest;
        }

        let tag = checked_tag(src, metadata);
        if metadata.enum_info().has_payload(tag) {
            let payload = metadata.generic_argument(0);
            payload.witnesses().initialize_with_take(dest, src, payload);
        }
        destructive_inject_enum_tag(dest, tag, metadata);
        dest
    }

    pub unsafe fn assign_with_take(dest: OpaquePtr, src: OpaquePtr, metadata: MetadataHandle) -> OpaquePtr {
        destroy(dest, metadata);
        initialize_with_take(dest, src, metadata)
    }

    pub unsafe fn destroy(obj: OpaquePtr, metadata: MetadataHandle) {
        let tag = checked_tag(obj, metadata);
        if metadata.enum_info().has_payload(tag) {
            let payload = metadata.generic_argument(0);
            payload.witnesses().destroy(obj, payload);
        }
    }

    pub unsafe fn describe(obj: ConstOpaquePtr, metadata: MetadataHandle, f: &mut fmt::Formatter) -> fmt::Result {
        let tag = checked_tag(obj, metadata);
        let info = metadata.enum_info();
        let case = info.case_name(tag).unwrap_or("?");
        if info.has_payload(tag) {
            write!(f, "{}({})", case, metadata.generic_argument(0).describe(obj))
        } else {
            f.write_str(case)
        }
    }
}

unsafe fn tag(obj: ConstOpaquePtr, metadata: MetadataHandle) -> u32 {
    (metadata.witnesses().enum_witnesses(metadata).get_enum_tag)(obj, metadata)
}

unsafe fn inject(obj: OpaquePtr, tag: u32, metadata: MetadataHandle) {
    (metadata.witnesses().enum_witnesses(metadata).destructive_inject_enum_tag)(obj, tag, metadata)
}

/// Initializes `dest` to `some` of a copy of `x`.
unsafe fn init_some(dest: OpaquePtr, x: ConstOpaquePtr, metadata: MetadataHandle) {
    let payload = metadata.generic_argument(0);
    payload.witnesses().copy_into(dest, x, payload);
    inject(dest, SOME_TAG, metadata);
}

/// Checks that a `Self` metadata argument really is a `GenericOpt`.
fn self_metadata(frame: &CallFrame, idx: usize) -> MetadataHandle {
    let metadata = frame.metadata(idx);
    if generic_opt(metadata.generic_argument(0)) != metadata {
        fatal(FatalError::SignatureMismatch {
            symbol: frame.symbol().to_owned(),
            detail: format!("{} is not a GenericOpt", metadata.name()),
        })
    }
    metadata
}

unsafe fn generic_opt_accessor(frame: &CallFrame) -> Ret {
    if let Err(err) = frame.request(0).state() {
        fatal(err)
    }
    Ret::Metadata(MetadataResponse::complete(generic_opt(frame.metadata(1))))
}

unsafe fn make_generic_opt(frame: &CallFrame) -> Ret {
    let metadata = generic_opt(frame.metadata(2));
    init_some(frame.result(0), frame.opaque(1), metadata);
    Ret::Void
}

unsafe fn make_concrete_opt(frame: &CallFrame) -> Ret {
    let payload = resolve::<u16>();
    let metadata = generic_opt(payload);
    let x = frame.by_value(1, payload);
    frame.return_by_value(0, metadata, |dest| init_some(dest, x.as_ptr(), metadata))
}

unsafe fn take_generic_opt(frame: &CallFrame) -> Ret {
    let metadata = generic_opt(frame.metadata(1));
    print(metadata.describe(frame.opaque(0)).to_string());
    Ret::Void
}

unsafe fn take_concrete_opt(frame: &CallFrame) -> Ret {
    let metadata = generic_opt(resolve::<u16>());
    let x = frame.by_value(0, metadata);
    print(format!("CONCRETE opt: {} ;", metadata.describe(x.as_ptr())));
    Ret::Void
}

unsafe fn inout_generic_opt(frame: &CallFrame) -> Ret {
    let metadata = generic_opt(frame.metadata(2));
    let x = frame.inout(0);
    let y = frame.opaque(1);

    match tag(x, metadata) {
        SOME_TAG => {
            metadata.witnesses().destroy(x, metadata);
            inject(x, NONE_TAG, metadata);
        },
        _ => init_some(x, y, metadata),
    }
    Ret::Void
}

unsafe fn inout_concrete_opt(frame: &CallFrame) -> Ret {
    let metadata = generic_opt(resolve::<u16>());
    let x = frame.inout(0);

    if tag(x, metadata) == SOME_TAG {
        let value = ptr::read_unaligned(x as *const u16);
        let tripled = value.checked_mul(3)
                           .unwrap_or_else(|| fatal(FatalError::Overflow("inoutConcreteOpt")));
        ptr::write_unaligned(x as *mut u16, tripled);
    }
    Ret::Void
}

unsafe fn method(frame: &CallFrame) -> Ret {
    let metadata = self_metadata(frame, 0);
    let copy_of_self = OpaqueCell::copy_of(metadata, frame.opaque(1));
    print(format!("GenericOpt<T>::testme::{};", metadata.describe(copy_of_self.as_ptr())));
    Ret::Void
}

unsafe fn reset(frame: &CallFrame) -> Ret {
    let metadata = self_metadata(frame, 0);
    let this = frame.inout(1);

    metadata.witnesses().destroy(this, metadata);
    inject(this, NONE_TAG, metadata);
    Ret::Void
}

unsafe fn generic_method(frame: &CallFrame) -> Ret {
    let metadata = self_metadata(frame, 2);
    let u = frame.metadata(3);
    let x = frame.opaque(1);
    let this = frame.opaque(4);

    print(format!("GenericOpt<T>::genericMethod<T>::{},{};", metadata.describe(this), u.describe(x)));

    u.witnesses().copy_into(frame.result(0), x, u);
    Ret::Void
}

unsafe fn computed_prop(frame: &CallFrame) -> Ret {
    self_metadata(frame, 0);
    let _this = frame.opaque(1);
    Ret::Int(42)
}

fn function(symbol: &'static str, params: &'static [ParamKind], ret: RetKind, entry: Entry) -> Function {
    Function {
        symbol,
        signature: Signature { params, ret },
        entry,
    }
}

/// Registers the module's entry points.
///
/// Only the concrete `GenericOpt<UInt16>` functions classify their values; `self` and anything of
/// generic type cross as opaque pointers, and generic results are written to the result buffer.
pub fn register(table: &mut SymbolTable) {
    use ParamKind::{ByValue, InOut, Metadata, Opaque, Request};
    use ParamKind::Result as Out;

    table.register(function(symbols::GENERIC_OPT_METADATA_ACCESSOR, &[Request, Metadata], RetKind::Metadata, generic_opt_accessor));

    table.register(function(symbols::MAKE_GENERIC_OPT, &[Out, Opaque, Metadata], RetKind::Indirect, make_generic_opt));
    table.register(function(symbols::MAKE_CONCRETE_OPT, &[Out, ByValue], RetKind::ByValue, make_concrete_opt));
    table.register(function(symbols::TAKE_GENERIC_OPT, &[Opaque, Metadata], RetKind::Void, take_generic_opt));
    table.register(function(symbols::TAKE_CONCRETE_OPT, &[ByValue], RetKind::Void, take_concrete_opt));
    table.register(function(symbols::INOUT_GENERIC_OPT, &[InOut, Opaque, Metadata], RetKind::Void, inout_generic_opt));
    table.register(function(symbols::INOUT_CONCRETE_OPT, &[InOut], RetKind::Void, inout_concrete_opt));

    table.register(function(symbols::METHOD, &[Metadata, Opaque], RetKind::Void, method));
    table.register(function(symbols::RESET, &[Metadata, InOut], RetKind::Void, reset));
    table.register(function(symbols::GENERIC_METHOD, &[Out, Opaque, Metadata, Metadata, Opaque], RetKind::Indirect, generic_method));
    table.register(function(symbols::COMPUTED_PROP, &[Metadata, Opaque], RetKind::Int, computed_prop));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let metadata = generic_opt(resolve::<u16>());
        assert_eq!(metadata.name(), "GenericOpt<u16>");
        assert_eq!(metadata.layout(), Layout::from_size_align(4, 2).unwrap());
        assert_eq!(metadata.enum_info().tag_offset, 2);
        assert!(metadata.witnesses().is_pod());

        let metadata = generic_opt(resolve::<()>());
        assert_eq!(metadata.layout(), Layout::from_size_align(1, 1).unwrap());
        assert_eq!(metadata.enum_info().tag_offset, 0);

        let metadata = generic_opt(resolve::<String>());
        assert_eq!(metadata.enum_info().tag_offset, mem::size_of::<String>());
        assert!(!metadata.witnesses().is_pod());
    }

    #[test]
    fn cached() {
        assert_eq!(generic_opt(resolve::<u32>()), generic_opt(resolve::<u32>()));
        assert_ne!(generic_opt(resolve::<u32>()), generic_opt(resolve::<i32>()));
    }

    #[test]
    fn wrong_arity() {
        assert!(matches!(build_generic_opt(&[]), Err(FatalError::MetadataUnavailable(_))));
    }

    #[test]
    fn witnesses() {
        let metadata = generic_opt(resolve::<String>());
        let s = String::from("payload");

        unsafe {
            let mut some = OpaqueCell::allocate(metadata);
            some.initialize_with(|dest| init_some(dest, &s as *const String as ConstOpaquePtr, metadata));
            assert_eq!(some.tag(), SOME_TAG);
            assert_eq!(metadata.describe(some.as_ptr()).to_string(), "some(\"payload\")");

            let mut none = OpaqueCell::allocate(metadata);
            none.initialize_with(|dest| inject(dest, NONE_TAG, metadata));
            assert_eq!(metadata.describe(none.as_ptr()).to_string(), "none");

            let copy = OpaqueCell::copy_of(metadata, some.as_ptr());
            (metadata.witnesses().assign_with_copy)(some.as_mut_ptr(), none.as_ptr(), metadata);
            assert_eq!(some.tag(), NONE_TAG);
            assert_eq!(metadata.describe(copy.as_ptr()).to_string(), "some(\"payload\")");
        }
    }

    #[test]
    fn signatures() {
        use ParamKind::{ByValue, InOut, Metadata, Opaque};
        use ParamKind::Result as Out;

        let mut table = SymbolTable::default();
        register(&mut table);
        let signature = |symbol: &str| table.lookup(symbol).map(|function| function.signature).unwrap();

        // generic values never cross by value
        for (symbol, params, ret) in &[
            (symbols::MAKE_GENERIC_OPT, &[Out, Opaque, Metadata][..], RetKind::Indirect),
            (symbols::TAKE_GENERIC_OPT, &[Opaque, Metadata][..], RetKind::Void),
            (symbols::INOUT_GENERIC_OPT, &[InOut, Opaque, Metadata][..], RetKind::Void),
            (symbols::METHOD, &[Metadata, Opaque][..], RetKind::Void),
            (symbols::RESET, &[Metadata, InOut][..], RetKind::Void),
            (symbols::GENERIC_METHOD, &[Out, Opaque, Metadata, Metadata, Opaque][..], RetKind::Indirect),
            (symbols::COMPUTED_PROP, &[Metadata, Opaque][..], RetKind::Int),
        ] {
            assert_eq!(signature(*symbol).params, *params, "{}", symbol);
            assert_eq!(signature(*symbol).ret, *ret, "{}", symbol);
        }

        assert_eq!(signature(symbols::MAKE_CONCRETE_OPT).params, &[Out, ByValue]);
        assert_eq!(signature(symbols::MAKE_CONCRETE_OPT).ret, RetKind::ByValue);
        assert_eq!(signature(symbols::TAKE_CONCRETE_OPT).params, &[ByValue]);
    }

    #[test]
    fn struct_for_enum() {
        take_transcript();
        let s = StructForEnum::new();
        let copy = s.clone();
        assert!(Rc::ptr_eq(&s.x, &copy.x));
        assert_eq!(resolve::<StructForEnum>().name(), "StructForEnum");
        assert_eq!(unsafe { resolve::<StructForEnum>().describe(&s as *const StructForEnum as ConstOpaquePtr) }.to_string(),
                   "StructForEnum(x: TracksDeinit)");

        drop(s);
        assert_eq!(take_transcript(), vec!["init-TracksDeinit"]);
        drop(copy);
        assert_eq!(take_transcript(), vec!["destroy-TracksDeinit"]);
    }

    #[test]
    fn transcript() {
        take_transcript();
        print("hello".to_owned());
        print("world".to_owned());
        assert_eq!(take_transcript(), vec!["hello", "world"]);
        assert!(take_transcript().is_empty());
    }
}
