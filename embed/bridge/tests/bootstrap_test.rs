use bridge::{BridgeConfig, BridgeContext, StaticLoader, StaticModule};
use std::path::PathBuf;

// Kept alone in its own binary: the runtime's path settings are process-wide.
#[test]
fn first_resolution_configures_the_runtime() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = BridgeConfig {
        assembly_path: Some(PathBuf::from("/srv/app/managed")),
        runtime_assembly_path: Some(PathBuf::from("/srv/app/mono/4.5")),
        ..BridgeConfig::default()
    };
    let loader = StaticLoader::new().register("managed", StaticModule::new().with_symbols(stub_runtime::exports()));
    let ctx = BridgeContext::new(config, Box::new(loader)).unwrap();

    assert!(!ctx.channel().is_installed());
    let handle = ctx.resolve("managed").unwrap();

    assert!(ctx.channel().is_installed());
    assert!(stub_runtime::hook_installed());
    assert_eq!(stub_runtime::assembly_path().as_deref(), Some("/srv/app/managed"));
    assert_eq!(stub_runtime::runtime_assembly_path().as_deref(), Some("/srv/app/mono/4.5"));
    assert_eq!(handle.name(), "managed");
    assert_eq!(handle.assembly_path(), None);
}
