//! Version subcommand implementation

pub fn run() {
    println!("wsnet {}", env!("CARGO_PKG_VERSION"));
    println!("socket: {}", wsnet_common::SOCKET_FILE);
    println!("port-forward port: {}", wsnet_common::DEFAULT_PORT_FORWARD_PORT);

    #[cfg(target_os = "linux")]
    println!("target: linux");
    #[cfg(target_os = "macos")]
    println!("target: macos");
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    println!("target: unknown");
}
