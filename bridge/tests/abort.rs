//! Contract violations abort the process.
//!
//! Each test re-runs this test binary, filtered down to itself, with `ABORT_CHILD_VAR` set; the
//! child then performs the violation, and the parent checks how it died.

use std::env;
use std::process::{Command, Output};

use witness::resolve;

use bridge::*;

const ABORT_CHILD_VAR: &str = "GENOPT_ABORT_CHILD";

fn expect_abort(name: &str, violation: impl FnOnce()) -> Output {
    if env::var(ABORT_CHILD_VAR).map(|v| v == name).unwrap_or(false) {
        let _ = env_logger::builder().is_test(true).try_init();
        violation();
        panic!("{} did not abort", name);
    }

    let output = Command::new(env::current_exe().unwrap())
                         .args(&[name, "--exact", "--test-threads=1", "--nocapture"])
                         .env(ABORT_CHILD_VAR, name)
                         .output()
                         .unwrap();

    assert!(!output.status.success(), "{} exited successfully", name);

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(6), "{} was not killed by SIGABRT", name);
    }

    output
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn get_some_on_none() {
    let output = expect_abort("get_some_on_none", || {
        let opt = GenericOpt::<u16>::none();
        opt.get_some();
    });
    assert!(stderr(&output).contains("payload-less case `none` of GenericOpt<u16>"));
}

#[test]
fn into_some_on_none() {
    let output = expect_abort("into_some_on_none", || {
        GenericOpt::<String>::none().into_some();
    });
    assert!(stderr(&output).contains("payload-less case `none` of GenericOpt<String>"));
}

#[test]
fn concrete_overflow() {
    let output = expect_abort("concrete_overflow", || {
        let mut x = make_concrete_opt(30000);
        inout_concrete_opt(&mut x);
    });
    assert!(stderr(&output).contains("arithmetic overflow in inoutConcreteOpt"));
}

#[test]
fn unknown_symbol() {
    let output = expect_abort("unknown_symbol", || unsafe {
        Bridge::global().call("$s8Generics7missingyyF", &[]);
    });
    assert!(stderr(&output).contains("unknown symbol $s8Generics7missingyyF"));
}

#[test]
fn signature_mismatch() {
    let output = expect_abort("signature_mismatch", || unsafe {
        Bridge::global().call(symbols::TAKE_CONCRETE_OPT, &[Arg::Metadata(resolve::<u16>())]);
    });
    assert!(stderr(&output).contains("signature mismatch"));
}

#[test]
fn generic_value_passed_directly() {
    let output = expect_abort("generic_value_passed_directly", || unsafe {
        let bridge = Bridge::global();
        let x = GenericOpt::some(7u16);
        bridge.call(symbols::TAKE_GENERIC_OPT, &[
            bridge.pass_by_value(GenericOpt::<u16>::metadata(), x.as_opaque()),
            Arg::Metadata(resolve::<u16>()),
        ]);
    });
    assert!(stderr(&output).contains("argument 0 should be Opaque"));
}

#[test]
fn direct_return_of_indirect_type() {
    let output = expect_abort("direct_return_of_indirect_type", || unsafe {
        let bridge = Bridge::global();
        let x = 3u16;
        let ret = match bridge.pass_by_value(resolve::<u16>(), &x as *const u16 as *const u8) {
            Arg::Direct(value) => Ret::Direct(value),
            other => panic!("{:?}", other),
        };
        let mut s = String::new();
        bridge.receive_by_value(resolve::<String>(), ret, &mut s as *mut String as *mut u8);
    });
    assert!(stderr(&output).contains("layout of String disagrees with its metadata"));
}

#[test]
fn duplicate_symbol() {
    use bridge::adapter::{CallFrame, Function, ParamKind, RetKind, Signature, SymbolTable};

    unsafe fn nop(_: &CallFrame) -> Ret {
        Ret::Void
    }

    let output = expect_abort("duplicate_symbol", || {
        let function = Function {
            symbol: symbols::RESET,
            signature: Signature { params: &[ParamKind::Metadata, ParamKind::InOut], ret: RetKind::Void },
            entry: nop,
        };

        let mut table = SymbolTable::default();
        table.register(function);
        table.register(function);
    });
    assert!(stderr(&output).contains(&format!("symbol {} registered twice", symbols::RESET)));
}

#[test]
fn double_destroy() {
    let output = expect_abort("double_destroy", || {
        let x = 1u64;
        let mut cell = unsafe { OpaqueCell::copy_of(resolve::<u64>(), &x as *const u64 as *const u8) };
        cell.destroy();
        cell.destroy();
    });
    assert!(stderr(&output).contains("destroyed while not live"));
}

#[test]
fn invalid_tag() {
    let output = expect_abort("invalid_tag", || {
        let mut opt = GenericOpt::some(1u16);
        unsafe { *opt.as_opaque_mut().add(2) = 7 };
        opt.case();
    });
    assert!(stderr(&output).contains("invalid enum tag 7 for GenericOpt<u16>"));
}
