use dhtfox::component::COMPONENT_ABI_VERSION;

/// Display version information
pub fn execute() {
    println!("dhtfox {}", env!("CARGO_PKG_VERSION"));
    println!("DHT bridge for caching web proxies");
    println!("component ABI version {}", COMPONENT_ABI_VERSION);
}
