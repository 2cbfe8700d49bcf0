use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use appcache_engine::{
    AppCacheConfig, AppCacheEvent, AppCacheService, HostId, ResponseLookup, Status,
};
use clap::Parser;
use error::AppError;
use tokio::sync::mpsc;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use url::Url;

mod cli;
mod error;
mod sink;

use cli::{CliArgs, Command};
use sink::{ChannelSink, SinkMessage};

/// The CLI drives the engine through a single host.
const HOST: HostId = HostId(1);

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<(), AppError> {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true);

    let result = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            let multi_writer = MakeWriterExt::and(std::io::stdout, file);
            tracing::subscriber::set_global_default(builder.with_writer(multi_writer).finish())
        }
        None => {
            tracing::subscriber::set_global_default(builder.with_writer(std::io::stdout).finish())
        }
    };
    result.map_err(|e| AppError::Initialization(e.to_string()))
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();
    init_logging(args.verbose, args.log_file.as_deref())?;

    let mut builder = AppCacheConfig::builder();
    if let Some(dir) = &args.storage_dir {
        builder = builder.with_storage_path(dir.clone());
    }

    match args.command {
        Command::Update {
            manifest_url,
            document,
            concurrency,
            timeout,
            no_mime_check,
            quota,
        } => {
            if concurrency == 0 {
                return Err(AppError::InvalidInput(
                    "concurrency must be at least 1".to_string(),
                ));
            }
            builder = builder
                .with_fetch_concurrency(concurrency)
                .with_timeout(Duration::from_secs(timeout))
                .with_manifest_mime_check(!no_mime_check);
            if let Some(quota) = quota {
                builder = builder.with_group_quota(quota);
            }
            let service = AppCacheService::with_http(builder.build())?;
            let document = document.unwrap_or_else(|| manifest_url.clone());
            run_update(&service, &manifest_url, &document).await
        }
        Command::Lookup { manifest_url, url } => {
            let service = AppCacheService::with_http(builder.build())?;
            run_lookup(&service, &manifest_url, &url).await
        }
    }
}

/// Select the manifest's cache for one document and report every
/// notification until the update ends.
async fn run_update(
    service: &AppCacheService,
    manifest_url: &Url,
    document: &Url,
) -> Result<(), AppError> {
    info!(manifest_url = %manifest_url, document = %document, "Updating application cache");

    let (sink, mut rx) = ChannelSink::new();
    let backend = service.register_backend(Arc::new(sink));
    backend.register_host(HOST);
    if !backend
        .select_cache(HOST, document, None, Some(manifest_url))
        .await
    {
        return Err(AppError::InvalidInput(format!(
            "could not select a cache for {document}"
        )));
    }

    let mut failure = None;
    let mut finished = false;
    while !finished {
        let message = tokio::select! {
            message = rx.recv() => message,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling update");
                service.shutdown();
                failure = Some("interrupted".to_string());
                break;
            }
        };
        let Some(message) = message else {
            break;
        };
        match message {
            SinkMessage::CacheSelected { cache_id, status } => match cache_id {
                Some(cache_id) => info!(cache_id = %cache_id, status = %status, "Selected cache"),
                None => {
                    info!(status = %status, "No cache selected yet");
                    // Cross-origin manifests select no cache and start nothing.
                    if manifest_url.origin() != document.origin() {
                        failure = Some("manifest is not same-origin with the document".into());
                        break;
                    }
                }
            },
            SinkMessage::StatusChanged(status) => debug!(status = %status, "Status changed"),
            SinkMessage::Event(event) => {
                finished = event.is_terminal();
                report_event(&event);
                if let AppCacheEvent::Error(details) = event {
                    failure = Some(details.message);
                }
            }
        }
    }

    service.wait_for_idle(manifest_url).await;
    if let Some(snapshot) = service.group_snapshot(manifest_url) {
        info!(
            group = %snapshot.group_id,
            newest_cache = ?snapshot.newest_cache,
            old_caches = snapshot.old_caches.len(),
            obsolete = snapshot.is_obsolete,
            "Group state"
        );
    }
    let status = backend.get_status(HOST).unwrap_or(Status::Uncached);
    info!(status = %status, "Final status");
    backend.close().await;

    match failure {
        Some(message) => Err(AppError::UpdateFailed(message)),
        None => Ok(()),
    }
}

fn report_event(event: &AppCacheEvent) {
    match event {
        AppCacheEvent::Progress {
            url,
            total,
            completed,
        } => info!(url = %url, "[{completed}/{total}] downloaded"),
        AppCacheEvent::Error(details) => error!(
            reason = ?details.reason,
            url = ?details.url.as_ref().map(Url::as_str),
            status = ?details.status,
            "ERROR: {}",
            details.message
        ),
        other => info!("{:?}", other.id()),
    }
}

/// Print how `url` would be served from the stored cache of `manifest_url`.
async fn run_lookup(
    service: &AppCacheService,
    manifest_url: &Url,
    url: &Url,
) -> Result<(), AppError> {
    let Some(lookup) = service.lookup(manifest_url, url).await? else {
        return Err(AppError::InvalidInput(format!(
            "no complete cache stored for {manifest_url}"
        )));
    };

    match lookup {
        ResponseLookup::Entry {
            cache_id,
            storage_key,
            ..
        } => {
            let size = service
                .read_body(&storage_key)
                .await?
                .map(|(body, _)| body.len());
            info!(cache_id = %cache_id, key = %storage_key, size = ?size, "{url}: served from cache");
        }
        ResponseLookup::Fallback {
            cache_id,
            namespace_url,
            fallback_url,
            ..
        } => info!(
            cache_id = %cache_id,
            namespace = %namespace_url,
            "{url}: network, falling back to {fallback_url}"
        ),
        ResponseLookup::Network => info!("{url}: network"),
        ResponseLookup::NotFound => info!("{url}: not found"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use appcache_engine::MemoryStorage;
    use appcache_engine::transport::{MockResponse, MockTransport};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn service(transport: MockTransport) -> AppCacheService {
        let config = AppCacheConfig::builder()
            .with_retries(0, Duration::from_millis(10))
            .build();
        AppCacheService::new(config, Arc::new(MemoryStorage::new()), Arc::new(transport))
    }

    #[tokio::test]
    async fn test_update_then_lookup() {
        let manifest_url = url("http://example.com/app.appcache");
        let transport = MockTransport::new();
        transport.set(&manifest_url, MockResponse::manifest("CACHE MANIFEST\n/a.js\n"));
        transport.set(&url("http://example.com/a.js"), MockResponse::ok("a"));
        let service = service(transport);

        run_update(&service, &manifest_url, &manifest_url)
            .await
            .unwrap();
        run_lookup(&service, &manifest_url, &url("http://example.com/a.js"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_error_is_reported() {
        let manifest_url = url("http://example.com/app.appcache");
        let transport = MockTransport::new();
        transport.set(&manifest_url, MockResponse::status(500));
        let service = service(transport);

        let result = run_update(&service, &manifest_url, &manifest_url).await;
        assert!(matches!(result, Err(AppError::UpdateFailed(_))));
        assert!(matches!(
            run_lookup(&service, &manifest_url, &manifest_url).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_origin_document_fails() {
        let service = service(MockTransport::new());
        let result = run_update(
            &service,
            &url("http://example.com/app.appcache"),
            &url("http://other.example/index.html"),
        )
        .await;
        assert!(matches!(result, Err(AppError::UpdateFailed(_))));
    }
}
