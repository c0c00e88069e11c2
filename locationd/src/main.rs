use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ridge_geolocation_api::{
    AUXILIARY_TIMEOUT, CellLookupClient, ContributionClient, ElevationClient,
    TriangulationClient,
};
use ridge_locationd::arbitrator::Arbitrator;
use ridge_locationd::cache::CellCache;
use ridge_locationd::cell::CellularDataCollector;
use ridge_locationd::cell::modem::{AtGnssReceiver, AtModem, AtModemCollector};
use ridge_locationd::config::{Cli, Config};
use ridge_locationd::contribution::ContributionQueue;
use ridge_locationd::fuser::LocationFuser;
use ridge_locationd::ratelimit::RateLimiter;
use ridge_locationd::resolver::CellResolver;
use ridge_locationd::scheduler::QueryScheduler;
use ridge_locationd::service::{self, Core};
use ridge_locationd::sources::LocationSource;
use ridge_locationd::sources::cell_resolver::CellResolverSource;
use ridge_locationd::sources::gnss::GnssSource;
use ridge_locationd::sources::satellite::SatelliteTelemetrySource;
use ridge_locationd::sources::triangulation::TriangulationSource;
use ridge_locationd::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    telemetry::init("info");

    let cli = Cli::parse();
    let config = Config::from_cli(&cli);
    config.validate().map_err(|e| eyre!(e.to_string()))?;

    info!(
        sources = ?config.arbitrator.priority,
        scan_interval_s = config.service.scan_interval.as_secs(),
        cache = %config.cache.path.display(),
        "starting Ridge location service"
    );

    let cache = Arc::new(
        CellCache::open(config.cache.clone())
            .await
            .map_err(|e| eyre!("cannot open cell cache: {e}"))?,
    );
    let limiter = Arc::new(RateLimiter::load(config.rate_limit.clone()).await);

    let http = ridge_geolocation_api::http_client()?;
    let lookup_client = match (&config.provider.lookup_url, &config.provider.api_key) {
        (Some(url), Some(key)) => Some(Arc::new(CellLookupClient::new(
            http.clone(),
            url.parse()?,
            key.clone(),
        ))),
        _ => None,
    };
    let contribution_client =
        match (&config.provider.contribute_url, &config.provider.contribute_token) {
            (Some(url), Some(token)) => Some(Arc::new(ContributionClient::new(
                http.clone(),
                url.parse()?,
                token.clone(),
            ))),
            _ => None,
        };
    let elevation_client = match &config.provider.elevation_url {
        Some(url) => {
            let aux = reqwest::Client::builder()
                .timeout(AUXILIARY_TIMEOUT)
                .build()?;
            Some(Arc::new(ElevationClient::new(aux, url.parse()?)))
        }
        None => None,
    };

    let resolver = Arc::new(CellResolver::new(
        cache.clone(),
        limiter.clone(),
        lookup_client,
        config.resolver.clone(),
    ));
    let fuser = Arc::new(LocationFuser::new(config.fuser.clone()));
    let scheduler = Arc::new(QueryScheduler::new(config.scheduler.clone()));

    // The modem is shared by the environment scanner and modem GNSS.
    let modem = if config.cellular.enabled {
        match AtModem::open(&config.cellular.device) {
            Ok(modem) => Some(modem),
            Err(e) => {
                warn!(error = %e, "cell modem unavailable, cellular sources disabled");
                None
            }
        }
    } else {
        None
    };
    let collector: Option<Arc<dyn CellularDataCollector>> = modem
        .clone()
        .map(|m| Arc::new(AtModemCollector::new(m)) as Arc<dyn CellularDataCollector>);

    let mut registry: Vec<Arc<dyn LocationSource>> = Vec::new();
    for (slot, name) in config.arbitrator.priority.iter().enumerate() {
        let priority = slot as u32;
        match name.as_str() {
            "gnss" => {
                // A dedicated GNSS AT port counts as the on-device receiver.
                let Some(device) = &config.cellular.gnss_device else {
                    continue;
                };
                match AtModem::open(device) {
                    Ok(port) => registry.push(Arc::new(GnssSource::new(
                        "gnss",
                        priority,
                        Arc::new(AtGnssReceiver::new(port)),
                    ))),
                    Err(e) => warn!(error = %e, "GNSS port unavailable"),
                }
            }
            "modem_gnss" => {
                let Some(modem) = modem.clone() else { continue };
                registry.push(Arc::new(GnssSource::new(
                    "modem_gnss",
                    priority,
                    Arc::new(AtGnssReceiver::new(modem)),
                )));
            }
            "satellite" => {
                registry.push(Arc::new(SatelliteTelemetrySource::new(
                    priority,
                    config.provider.satellite_urls.clone(),
                    http.clone(),
                )));
            }
            "triangulation" => {
                let Some(collector) = collector.clone() else { continue };
                let clients: Vec<TriangulationClient> = config
                    .provider
                    .triangulation_urls
                    .iter()
                    .filter_map(|url| {
                        url.parse()
                            .map(|url| TriangulationClient::new(http.clone(), url))
                            .ok()
                    })
                    .collect();
                registry.push(Arc::new(TriangulationSource::new(
                    priority, collector, None, clients,
                )));
            }
            "cell_resolver" => {
                let Some(collector) = collector.clone() else { continue };
                registry.push(Arc::new(CellResolverSource::new(
                    priority,
                    collector,
                    resolver.clone(),
                    fuser.clone(),
                    scheduler.clone(),
                    cache.clone(),
                )));
            }
            other => warn!(source = other, "unknown source in priority list"),
        }
    }

    let cancel = CancellationToken::new();
    let arbitrator =
        Arc::new(Arbitrator::new(config.arbitrator.clone(), registry, cancel.clone()).await);

    let contributions = if config.contribution.enabled {
        Some(Arc::new(
            ContributionQueue::load(config.contribution.clone()).await,
        ))
    } else {
        None
    };

    let core = Arc::new(Core {
        config: config.clone(),
        cache,
        limiter,
        resolver,
        fuser,
        scheduler,
        arbitrator,
        collector,
        contributions,
        contribution_client,
        elevation_client,
    });

    if config.service.run_once {
        info!("running one collection cycle");
        match core.collect_cycle().await {
            Some(fix) => {
                println!("{}", serde_json::to_string_pretty(&fix)?);
                return Ok(());
            }
            None => return Err(eyre!("no source produced a fix")),
        }
    }

    setup_signal_handling(cancel.clone());
    service::run(core, cancel).await;
    info!("exiting gracefully");
    Ok(())
}

/// SIGINT/SIGTERM cancel the shared token; loops drain and flush.
fn setup_signal_handling(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down gracefully");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down gracefully");
            }
        }
        cancel.cancel();
    });
}
