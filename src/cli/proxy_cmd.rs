//! `proxy`: serve the runner proxy standalone until Ctrl+C.

use tokio_util::sync::CancellationToken;

use crate::capability;
use crate::channel::ChannelAddr;
use crate::config;
use crate::proxy::ProxyServer;

use super::{report_error, EXIT_CONFIG, EXIT_OK};

/// Run the proxy. `args` are the arguments after `proxy`.
///
/// Accepts `--listen ADDR` to override the derived listen address.
pub async fn run_proxy(args: &[String]) -> i32 {
    let mut listen: Option<ChannelAddr> = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Error: --listen requires an address");
                    return EXIT_CONFIG;
                };
                match value.parse() {
                    Ok(addr) => listen = Some(addr),
                    Err(e) => return report_error(&e),
                }
                i += 2;
            }
            other => {
                eprintln!("Unknown proxy option: {}", other);
                return EXIT_CONFIG;
            }
        }
    }

    let env = config::load();
    let profile = match capability::probe(env.platform, &[]) {
        Ok(p) => p,
        Err(e) => return report_error(&e),
    };
    let mut proxy_config = env.proxy_config(&profile);
    if let Some(addr) = listen {
        proxy_config.listen = addr;
    }

    let server = match ProxyServer::bind(&profile, proxy_config).await {
        Ok(s) => s,
        Err(e) => return report_error(&e),
    };
    eprintln!("Runner proxy listening on {}", server.local_addr());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Shutdown signal received, draining...");
        }
        signal.cancel();
    });

    match server.serve(shutdown).await {
        Ok(stats) => {
            eprintln!(
                "Proxy stopped: {} sessions ({} rejected, {} failed), {} bytes out, {} bytes in",
                stats.sessions_accepted,
                stats.sessions_rejected,
                stats.sessions_failed,
                stats.bytes_to_remote,
                stats.bytes_from_remote
            );
            EXIT_OK
        }
        Err(e) => report_error(&e),
    }
}
