use tally_config::Config;

/// Logs the effective configuration at startup.
pub fn dump_config(config: &Config) {
    tally_log::info!("launching tally");
    tally_log::info!("  interval: {}s", config.interval);
    tally_log::info!("  metric workers: {}", config.num_workers);
    tally_log::info!("  span workers: {}", config.num_span_workers);

    for addr in &config.statsd_listen_addresses {
        tally_log::info!("  statsd endpoint: {addr}");
    }
    for addr in &config.ssf_listen_addresses {
        tally_log::info!("  span endpoint: {addr}");
    }

    match &config.forward_address {
        Some(address) => tally_log::info!("  forwarding to {address}"),
        None => tally_log::info!("  operating as a global node"),
    }

    if config.forward_only {
        tally_log::info!("  forward-only: local sinks disabled");
    }

    if config.enable_profiling {
        tally_log::info!("  profiling enabled");
    }
}
