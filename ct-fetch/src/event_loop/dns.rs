//! DNS resolver owned by an [`EventLoop`](super::EventLoop).

use std::net::IpAddr;

use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    Resolver, TokioResolver,
};

/// Thin wrapper of the hickory resolver; cloning shares the underlying cache.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// Build a new `DnsResolver` through `ResolverConfig` and `ResolverOpts`.
    ///
    /// For using system config, create the instance by `DnsResolver::default()`.
    pub fn new(config: ResolverConfig, options: ResolverOpts) -> Self {
        let mut builder = Resolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().clone_from(&options);
        let resolver = builder.build();
        Self { resolver }
    }

    /// Resolve a host to an IP address.
    ///
    /// IP literals are returned as-is without querying anything.
    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.into_iter().next(),
            Err(err) => {
                tracing::debug!("failed to resolve {host:?}: {err}");
                None
            }
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        let (conf, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(system) => system,
            Err(err) => {
                tracing::warn!("failed to read system dns config, using defaults: {err}");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        // The default strategy is `Ipv4thenIpv6` which does not work in an IPv6 only
        // environment, trust the first configured name server.
        if conf
            .name_servers()
            .first()
            .is_some_and(|ns| ns.socket_addr.is_ipv6())
        {
            opts.ip_strategy = LookupIpStrategy::Ipv6thenIpv4;
        }
        Self::new(conf, opts)
    }
}
