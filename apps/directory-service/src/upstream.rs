use std::sync::Arc;
use std::time::Duration;

use harbor_core::health::{spawn_health_check, HealthCheckHandle, Probe};
use harbor_core::link::{register_with_retry, RetryPolicy, UpstreamLink};
use harbor_core::ControlError;
use harbor_proto::{Action, RegisterDirectoryReply};
use harbor_transport::{DeliveryClass, Outbound, TransportError};
use tracing::{debug, info};

use crate::directory::DirectoryService;

pub async fn register_once(
    directory: &DirectoryService,
    gds_url: &str,
    timeout: Duration,
) -> Result<u32, ControlError> {
    let registration = directory.registration();
    let types = registration.supported_types.len();
    let outbound = Outbound::action(
        directory.local_url(),
        gds_url,
        DeliveryClass::Execute,
        &Action::RegisterDirectory(registration),
        timeout,
    );
    let reply = directory
        .transport()
        .send(outbound)
        .await
        .map_err(ControlError::from_remote)?;
    let reply: RegisterDirectoryReply = serde_json::from_str(&reply).map_err(|_| {
        ControlError::from(TransportError::unexpected("directory registration", reply))
    })?;
    directory.set_upstream_id(reply.directory_id);
    info!(gds = gds_url, directory_id = reply.directory_id, types, "registered with global directory");
    Ok(reply.directory_id)
}

/// Bootstrap registration. Exhausting `policy` is fatal for the process.
pub async fn register(
    directory: &DirectoryService,
    gds_url: &str,
    policy: RetryPolicy,
    timeout: Duration,
) -> Result<u32, ControlError> {
    register_with_retry(gds_url, policy, || register_once(directory, gds_url, timeout)).await
}

pub fn spawn_monitor(
    directory: &Arc<DirectoryService>,
    gds_url: &str,
    period: Duration,
    timeout: Duration,
) -> HealthCheckHandle {
    let link = UpstreamLink::new(
        "gds",
        directory.local_url(),
        gds_url,
        directory.transport(),
        timeout,
    );
    let directory = Arc::clone(directory);
    let gds_url = gds_url.to_string();
    link.spawn_monitor(period, move || {
        let directory = Arc::clone(&directory);
        let gds_url = gds_url.clone();
        async move {
            register_once(&directory, &gds_url, timeout).await?;
            Ok(())
        }
    })
}

/// Send the aggregate node load upward every `period`.
pub fn spawn_load_reporter(
    directory: &Arc<DirectoryService>,
    gds_url: &str,
    period: Duration,
    timeout: Duration,
) -> HealthCheckHandle {
    let weak = Arc::downgrade(directory);
    let gds_url = gds_url.to_string();
    spawn_health_check("load-report", period, move || {
        let weak = weak.clone();
        let gds_url = gds_url.clone();
        async move {
            let Some(directory) = weak.upgrade() else {
                return Probe::Stop;
            };
            let Some(report) = directory.load_report() else {
                return Probe::Continue;
            };
            let outbound = Outbound::action(
                directory.local_url(),
                &gds_url,
                DeliveryClass::Queue,
                &Action::UpdateDirectoryLoad(report),
                timeout,
            );
            if let Err(err) = directory.transport().send(outbound).await {
                debug!(gds = %gds_url, error = %err, "load report failed");
            }
            Probe::Continue
        }
    })
}

#[cfg(test)]
mod tests {
    use harbor_proto::{LoadSample, RegisterNodeRequest};
    use harbor_transport::RecordingTransport;

    use super::*;
    use crate::directory::DirectorySettings;

    #[tokio::test(start_paused = true)]
    async fn registers_then_reports_load() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://gds", |outbound| match outbound.parsed() {
            Some(Action::RegisterDirectory(_)) => Ok(r#"{"directory_id":5}"#.into()),
            _ => Ok("OK".into()),
        });
        let directory = DirectoryService::new(DirectorySettings::default(), recording.clone());
        directory
            .register_node(RegisterNodeRequest {
                url: "http://n1".into(),
                supported_types: vec!["A".into()],
                load: LoadSample::new(30.0, 10.0),
            })
            .unwrap();

        let id = register(
            &directory,
            "http://gds",
            RetryPolicy::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(id, 5);

        let reporter = spawn_load_reporter(
            &directory,
            "http://gds",
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        tokio::time::sleep(Duration::from_millis(5100)).await;
        let reports = recording.actions_named("update_directory_load");
        assert_eq!(reports.len(), 1);
        let Action::UpdateDirectoryLoad(report) = &reports[0].1 else {
            panic!("expected load report");
        };
        assert_eq!(report.id, 5);
        assert_eq!(report.load.cpu_percent, 30.0);
        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_global_directory_is_fatal() {
        let recording = RecordingTransport::new();
        recording.set_unreachable("http://gds", true);
        let directory = DirectoryService::new(DirectorySettings::default(), recording.clone());
        let policy = RetryPolicy {
            interval: Duration::from_millis(500),
            max_attempts: 3,
        };
        let err = register(&directory, "http://gds", policy, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::RegistrationFailed(_)));
        assert!(directory.upstream_id().is_none());
    }
}
