// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the collaborators of the upgrade scheduler
//!
//! The scheduler itself owns no wire protocol or storage format.  It talks to
//! three collaborators through the traits defined here:
//!
//! * [`Gateway`]: the fleet-management control plane for one instance, which
//!   holds the in-flight upgrade policies and answers policy questions
//! * [`ConfigSource`]: where desired-state records come from
//! * [`VersionHistoryStore`]: where per-instance soak history is persisted

use async_trait::async_trait;
use semver::Version;
use slog_error_chain::SlogInlineError;
use thiserror::Error;
use upgrade_scheduler_types::history::VersionHistory;
use upgrade_scheduler_types::ids::{ClusterName, GateId, InstanceKey, PolicyId};
use upgrade_scheduler_types::policy::{
    ClusterRecord, CurrentUpgradePolicy, UpgradePolicySpec,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by a [`Gateway`]
#[derive(Debug, Error, SlogInlineError)]
pub enum GatewayError {
    #[error("gateway request {operation:?} failed")]
    Request {
        operation: &'static str,
        #[source]
        err: BoxError,
    },
    #[error("gateway request {operation:?} returned an invalid response: {message}")]
    InvalidResponse { operation: &'static str, message: String },
    #[error("cluster {0} is not known to the gateway")]
    UnknownCluster(ClusterName),
}

impl GatewayError {
    pub fn request<E>(operation: &'static str, err: E) -> Self
    where
        E: Into<BoxError>,
    {
        GatewayError::Request { operation, err: err.into() }
    }
}

/// Gateway response to a version-gate agreement
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GateAgreement {
    /// whether the gateway acknowledged the agreement
    pub accepted: bool,
}

/// The fleet-management control plane for one instance
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Returns the upgrade policies currently scheduled for `cluster`
    async fn current_policies(
        &self,
        cluster: &ClusterName,
    ) -> Result<Vec<CurrentUpgradePolicy>, GatewayError>;

    /// Schedules an upgrade for `cluster`
    async fn create_policy(
        &self,
        cluster: &ClusterName,
        spec: &UpgradePolicySpec,
    ) -> Result<(), GatewayError>;

    /// Cancels the upgrade policy `id` of `cluster`
    async fn delete_policy(
        &self,
        cluster: &ClusterName,
        id: &PolicyId,
    ) -> Result<(), GatewayError>;

    /// Returns the versions reachable from `current_version` on `channel`, in
    /// no particular order
    async fn available_upgrades(
        &self,
        current_version: &Version,
        channel: &str,
    ) -> Result<Vec<Version>, GatewayError>;

    async fn is_version_blocked(
        &self,
        version: &Version,
    ) -> Result<bool, GatewayError>;

    /// Returns the version gates `cluster` has already agreed to
    async fn version_agreements(
        &self,
        cluster: &ClusterName,
    ) -> Result<Vec<GateId>, GatewayError>;

    /// Returns the version gates required to upgrade into the `major.minor`
    /// release `version_prefix`
    async fn version_gates(
        &self,
        version_prefix: &str,
    ) -> Result<Vec<GateId>, GatewayError>;

    async fn agree_to_version_gate(
        &self,
        gate: &GateId,
        cluster: &ClusterName,
    ) -> Result<GateAgreement, GatewayError>;
}

/// Errors returned by a [`ConfigSource`]
#[derive(Debug, Error, SlogInlineError)]
pub enum ConfigSourceError {
    #[error("desired state for instance {0} is unavailable")]
    UnknownInstance(InstanceKey),
    #[error("failed to load desired state")]
    Load(#[source] BoxError),
}

/// Where desired-state records come from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Returns the desired-state records of all clusters managed by
    /// `instance`
    async fn desired_clusters(
        &self,
        instance: &InstanceKey,
    ) -> Result<Vec<ClusterRecord>, ConfigSourceError>;
}

/// Errors returned by a [`VersionHistoryStore`]
#[derive(Debug, Error, SlogInlineError)]
pub enum StoreError {
    #[error("failed to read version history for {key}")]
    Read {
        key: InstanceKey,
        #[source]
        err: BoxError,
    },
    #[error("failed to write version history for {key}")]
    Write {
        key: InstanceKey,
        #[source]
        err: BoxError,
    },
}

/// Persistence for per-instance version history
#[async_trait]
pub trait VersionHistoryStore: Send + Sync {
    /// Returns the stored history for `key`, if any
    async fn get(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<VersionHistory>, StoreError>;

    /// Stores `history` for `key`, replacing whatever was there
    async fn put(
        &self,
        key: &InstanceKey,
        history: &VersionHistory,
    ) -> Result<(), StoreError>;
}
