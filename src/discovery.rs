//! Instrument discovery.
//!
//! Enumerates candidate resources of one link kind, opens each in turn and
//! keeps the first whose `*IDN?` reply matches the requested name. Opening is
//! retried a bounded number of times per candidate.

use tracing::{debug, info, warn};

use crate::adapters::{LinkProvider, OpenError, SerialProvider, VisaProvider};
use crate::config::{DiscoveryConfig, LinkConfig, TransportKind};
use crate::error::DiscoveryError;
use crate::error_recovery::{Exhausted, RetryPolicy};
use crate::transport::Transport;

/// Provider for `kind` configured from the discovery settings.
pub fn provider_for(kind: TransportKind, discovery: &DiscoveryConfig) -> Box<dyn LinkProvider> {
    match kind {
        TransportKind::Serial => Box::new(SerialProvider::new(discovery.port_patterns.clone())),
        TransportKind::Bus => Box::new(VisaProvider),
    }
}

/// Candidate resources of `kind`, in probe order.
pub fn list_resources(
    kind: TransportKind,
    discovery: &DiscoveryConfig,
) -> Result<Vec<String>, DiscoveryError> {
    provider_for(kind, discovery).candidates()
}

/// Find and open the instrument identifying itself as `name_filter`.
///
/// An empty `name_filter` accepts the first candidate that answers `*IDN?`.
pub fn discover(
    kind: TransportKind,
    name_filter: &str,
    link_config: &LinkConfig,
    discovery: &DiscoveryConfig,
) -> Result<Transport, DiscoveryError> {
    let link_config = LinkConfig {
        kind,
        ..link_config.clone()
    };
    let provider = provider_for(kind, discovery);
    discover_with(
        provider.as_ref(),
        name_filter,
        &link_config,
        &RetryPolicy::from(discovery),
    )
}

/// Discovery over an arbitrary provider.
///
/// A busy candidate is retried within `policy`'s attempt budget, each
/// retry logged at `warn`, and is then skipped and reported as
/// `ResourceBusy` if nothing else matches.
///
/// # Errors
/// - `NoResourcesFound` if the provider lists no candidates
/// - `ResourceBusy` if no candidate matched and at least one stayed busy for
///   the whole retry budget
/// - `DeviceNotFound` if every candidate was probed without a match
pub fn discover_with(
    provider: &dyn LinkProvider,
    name_filter: &str,
    link_config: &LinkConfig,
    policy: &RetryPolicy,
) -> Result<Transport, DiscoveryError> {
    let kind = provider.kind();
    let candidates = provider.candidates()?;
    if candidates.is_empty() {
        return Err(DiscoveryError::NoResourcesFound(kind));
    }
    debug!(%kind, count = candidates.len(), "Probing candidates");

    let mut busy: Option<DiscoveryError> = None;
    for resource in &candidates {
        let link = match policy.run(
            resource,
            |_| provider.open(resource, link_config),
            |_| true,
        ) {
            Ok(link) => link,
            Err(Exhausted {
                attempts,
                last_error: OpenError::Busy(reason),
            }) => {
                warn!(resource = %resource, attempts, %reason, "Resource busy, skipping");
                busy = Some(DiscoveryError::ResourceBusy {
                    resource: resource.clone(),
                    attempts,
                });
                continue;
            }
            Err(Exhausted {
                attempts,
                last_error: OpenError::Failed(e),
            }) => {
                warn!(resource = %resource, attempts, error = %e, "Failed to open candidate");
                continue;
            }
        };

        let mut transport = match Transport::open(link, link_config.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(resource = %resource, error = %e, "Failed to configure candidate");
                continue;
            }
        };

        match transport.identify() {
            Ok(identity) if name_filter.is_empty() || identity == name_filter => {
                info!(resource = %resource, identity = %identity, "Instrument found");
                return Ok(transport);
            }
            Ok(identity) => {
                debug!(resource = %resource, identity = %identity, "Identity does not match");
            }
            Err(e) => {
                warn!(resource = %resource, error = %e, "Candidate did not identify");
            }
        }
        if let Err(e) = transport.close() {
            warn!(resource = %resource, error = %e, "Failed to close candidate");
        }
    }

    Err(busy.unwrap_or_else(|| DiscoveryError::DeviceNotFound {
        name: name_filter.to_string(),
        probed: candidates.len(),
    }))
}
