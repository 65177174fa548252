//! Domain services built on top of the remote clients

pub mod address_resolver;
pub mod routing;

pub use address_resolver::AddressResolver;
pub use routing::RouteResolver;
