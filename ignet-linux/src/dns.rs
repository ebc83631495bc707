//! Host name resolution for contexts that start with a lookup.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

pub type ResolveFuture = Pin<Box<dyn Future<Output = io::Result<SocketAddr>> + Send>>;

/// Turns a host name into one address of the wanted family.
pub trait Resolve: Send + Sync {
    fn resolve(&self, host: &str, port: u16, ipv6: bool) -> ResolveFuture;
}

/// Resolver backed by the system's `getaddrinfo`, via tokio's blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16, ipv6: bool) -> ResolveFuture {
        let host = host.to_string();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port)).await?.collect();
            pick(&addrs, ipv6).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no {} address for {}", if ipv6 { "IPv6" } else { "IPv4" }, host),
                )
            })
        })
    }
}

/// First address of the wanted family.
pub fn pick(addrs: &[SocketAddr], ipv6: bool) -> Option<SocketAddr> {
    addrs.iter().copied().find(|a| a.is_ipv6() == ipv6)
}
