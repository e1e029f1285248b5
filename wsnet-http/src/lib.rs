//! Protocol plumbing of the workspace network daemon: the rendezvous socket
//! multiplexer, the gRPC director, the HTTP tunnel proxy and HTTP port
//! forwarding.

pub mod client;
pub mod control;
pub mod grpc;
pub mod hijack;
pub mod network_proxy;
pub mod port_forward;
pub mod proxy;
mod serve;
pub mod sniff;

pub use client::{send_request, ProxyBody};
pub use control::ControlPlane;
pub use grpc::{BackendTarget, Director, GrpcProxyServer};
pub use network_proxy::{MuxServer, NetworkProxyService};
pub use port_forward::PortForwardService;
pub use proxy::{error_response, CredentialRelay, HttpProxyServer, ProxyHandler};
pub use sniff::{classify, Mux, PeekedStream, Route, RouteListener};
