//! Runs in its own process, as installation order matters.

use bridge::*;

#[test]
fn scheme_locked_by_earlier_metadata() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Publishing metadata locks in unsigned pointers.
    let _ = witness::resolve::<u16>();

    let blend = Config {
        pointer_auth: PointerAuthConfig::Blend { key: 1 },
        ..Config::default()
    };
    match Bridge::install(blend) {
        Err(InstallError::PointerAuth { config, .. }) => {
            assert_eq!(config.pointer_auth, PointerAuthConfig::Blend { key: 1 });
        },
        other => panic!("{:?}", other),
    }

    // The failed install left the bridge free, and unsigned pointers are still acceptable.
    let bridge = Bridge::install(Config::default()).unwrap();
    assert_eq!(bridge.config().pointer_auth, PointerAuthConfig::None);
    assert_eq!(make_concrete_opt(4).get_some(), 4);

    assert!(matches!(Bridge::install(Config::default()), Err(InstallError::AlreadyInitialized(_))));
}
