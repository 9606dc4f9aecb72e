//! Runs in its own process, as the pointer authentication scheme can only be installed once.

use bridge::*;

#[test]
fn blend_scheme() {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = Config::from_toml_str(r#"
        [pointer_auth]
        scheme = "blend"
        key = 0x5eed
    "#).unwrap();

    let bridge = Bridge::install(config).unwrap();
    assert_eq!(bridge.config().pointer_auth, PointerAuthConfig::Blend { key: 0x5eed });

    let opt = make_generic_opt(&String::from("signed"));
    assert_eq!(opt.get_some(), "signed");

    let mut x = make_concrete_opt(7);
    inout_concrete_opt(&mut x);
    assert_eq!(x.get_some(), 21);

    assert!(matches!(Bridge::install(Config::default()), Err(InstallError::AlreadyInitialized(_))));
}
