use loupe::address_space::{read_modules, AddressSpace};
use loupe::domain::Pid;
use loupe::symbols::{load_symbols, DebugInfo, ObjectFileSymbols, SymbolResolver};
use std::sync::Arc;

#[test]
fn test_load_symbols_of_own_binary() {
    let binary_path = env!("CARGO_BIN_EXE_loupe");

    let table = load_symbols(binary_path).expect("Failed to read symbols");
    assert!(!table.is_empty());
    assert!(
        table.search("main").next().is_some(),
        "No function containing 'main' among {} symbols",
        table.len()
    );

    // Every function is found by its own address
    for function in table.functions().iter().take(50) {
        let found = table.find_containing(function.address).expect("function not found");
        assert!(found.address <= function.address);
    }
}

#[test]
fn test_debug_info_maps_functions_to_source_lines() {
    let binary_path = env!("CARGO_BIN_EXE_loupe");
    let table = load_symbols(binary_path).expect("Failed to read symbols");
    let debug_info = DebugInfo::new(binary_path).expect("Failed to read debug info");

    let location = table
        .functions()
        .iter()
        .filter(|f| f.size > 0 && f.display_name().starts_with("loupe::"))
        .take(50)
        .find_map(|f| debug_info.line_info(f.address).ok())
        .expect("No loupe function has line information");
    assert!(location.file.as_deref().is_some_and(|file| file.ends_with(".rs")));
    assert!(location.line.is_some_and(|line| line > 0));
}

#[test]
fn test_resolver_on_running_process() {
    let pid = Pid(std::process::id());
    let modules = read_modules(pid).expect("Failed to read own modules");
    let address_space = Arc::new(AddressSpace::new());
    address_space.update_modules(pid, modules);
    let resolver = SymbolResolver::new(Arc::clone(&address_space), ObjectFileSymbols::new());

    // Address of a function in this test binary
    let address = test_resolver_on_running_process as *const () as u64;
    let info = resolver.resolve(pid, address);

    assert_eq!(info.absolute_address, address);
    assert!(info.module_path.contains("test_symbols"), "unexpected module {}", info.module_path);
    assert!(
        info.function_name.contains("test_resolver_on_running_process"),
        "resolved to {}",
        info.function_name
    );
    assert_eq!(info.offset_in_function, 0);
}
