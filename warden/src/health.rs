use chrono::{DateTime, Utc};
use coxswain_cloud::StoreError;
use coxswain_cloud::fleet::Fleet;
use coxswain_cloud::params::{self, Param, ParameterRegistry};
use coxswain_cloud::snapshots::SnapshotStore;
use coxswain_common::metrics::{MetricSink, Unit, names};
use coxswain_common::timefmt;

pub const DEFAULT_FAILURE_THRESHOLD: u64 = 3;

pub struct HealthDeps<'a> {
    pub fleet: &'a dyn Fleet,
    pub registry: &'a dyn ParameterRegistry,
    pub snapshots: &'a dyn SnapshotStore,
    pub sink: &'a dyn MetricSink,
}

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub cluster: String,
    pub failure_threshold: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HealthOutcome {
    /// At least one healthy instance; counter cleared.
    Healthy { instances: usize },

    /// Total loss observed but the threshold is not reached yet.
    Counting { failures: u64 },

    /// Threshold reached; disaster recovery armed on the named snapshot.
    Armed { backup_key: String, failures: u64 },

    /// Threshold reached but recovery was already armed by an earlier tick.
    AlreadyArmed { failures: u64 },

    /// Threshold reached and no snapshot exists to restore from.
    NoSnapshot { failures: u64 },
}

/// One scheduled health tick.
///
/// The failure counter is a read-modify-write on the parameter registry;
/// the loop runs on a single schedule, so ticks do not interleave. A
/// double-count under an operator-forced concurrent tick only accelerates
/// an arming decision that zero healthy instances already justified.
pub async fn run_health_check(
    deps: &HealthDeps<'_>,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> Result<HealthOutcome, StoreError> {
    let healthy = deps.fleet.healthy_control_plane().await?.len();
    deps.sink.put_metric(
        names::HEALTHY_CONTROL_PLANE_INSTANCES,
        healthy as f64,
        Unit::Count,
    );

    let outcome = if healthy > 0 {
        observe_healthy(deps, healthy).await?
    } else {
        observe_total_loss(deps, config, now).await?
    };

    deps.sink.flush();
    Ok(outcome)
}

async fn observe_healthy(
    deps: &HealthDeps<'_>,
    instances: usize,
) -> Result<HealthOutcome, StoreError> {
    let failures = params::get_u64(deps.registry, Param::FailureCount).await?;
    if failures > 0 {
        tracing::info!(instances, "control plane recovered; clearing failure counter");
        deps.registry.put(Param::FailureCount, "0").await?;
    }
    deps.sink
        .put_metric(names::CONSECUTIVE_HEALTH_FAILURES, 0.0, Unit::Count);

    if params::get_bool(deps.registry, Param::RestoreMode).await? {
        tracing::info!("restore mode was armed; clearing it");
        params::put_bool(deps.registry, Param::RestoreMode, false).await?;
        deps.sink
            .put_metric(names::CLUSTER_RECOVERED, 1.0, Unit::Count);
    }

    Ok(HealthOutcome::Healthy { instances })
}

async fn observe_total_loss(
    deps: &HealthDeps<'_>,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> Result<HealthOutcome, StoreError> {
    let failures = params::get_u64(deps.registry, Param::FailureCount).await? + 1;
    deps.registry
        .put(Param::FailureCount, &failures.to_string())
        .await?;
    deps.sink.put_metric(
        names::CONSECUTIVE_HEALTH_FAILURES,
        failures as f64,
        Unit::Count,
    );
    tracing::warn!(failures, "no healthy control-plane instances");

    if failures < config.failure_threshold {
        return Ok(HealthOutcome::Counting { failures });
    }

    if params::get_bool(deps.registry, Param::RestoreMode).await? {
        return Ok(HealthOutcome::AlreadyArmed { failures });
    }

    let Some(snapshot) = deps.snapshots.latest(&config.cluster).await? else {
        tracing::error!(
            failures,
            "threshold reached but no snapshot exists; cannot arm recovery"
        );
        return Ok(HealthOutcome::NoSnapshot { failures });
    };

    // Name the backup before raising the flag so a booting instance never
    // observes restore-mode without a restore target.
    deps.registry
        .put(Param::RestoreBackup, &snapshot.key)
        .await?;
    deps.registry
        .put(Param::RestoreTriggeredAt, &timefmt::format_utc(now))
        .await?;
    params::put_bool(deps.registry, Param::RestoreMode, true).await?;
    params::put_bool(deps.registry, Param::Initialized, false).await?;

    deps.sink
        .put_metric(names::AUTO_RECOVERY_TRIGGERED, 1.0, Unit::Count);
    tracing::error!(
        backup = %snapshot.key,
        failures,
        "armed disaster recovery; next booting instance will restore"
    );

    Ok(HealthOutcome::Armed {
        backup_key: snapshot.key,
        failures,
    })
}
