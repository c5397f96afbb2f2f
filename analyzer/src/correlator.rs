//! Matching analyzer acknowledgements to the snapshots that were sent.
//!
//! The analyzer reports progress as `(buffer, version)` pairs. Each buffer
//! keeps two [`VersionMarker`]s, one for parsing and one for analysis, that
//! resolve such a pair back to a snapshot and only ever move forward.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use anchor_types::{BufferId, Snapshot};

use crate::document::Document;
use crate::protocol::FileVersionsEvent;

/// Which acknowledgement an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Parse,
    Analysis,
}

/// What happened to a marker when a version was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MarkerUpdate {
    Advanced(Snapshot),
    /// Older than what is already acknowledged.
    Stale { acknowledged: i32 },
    /// No snapshot with that version was ever sent.
    Unknown,
}

/// Last acknowledged snapshot plus the ones sent and still awaited.
#[derive(Debug, Default)]
pub(crate) struct VersionMarker {
    acknowledged: Option<Snapshot>,
    expected: BTreeMap<i32, Snapshot>,
}

impl VersionMarker {
    pub fn expect(&mut self, snapshot: Snapshot) {
        self.expected.insert(snapshot.version(), snapshot);
    }

    pub fn withdraw(&mut self, versions: &[i32]) {
        for version in versions {
            self.expected.remove(version);
        }
    }

    pub fn clear_expected(&mut self) {
        self.expected.clear();
    }

    pub fn reset(&mut self) {
        self.acknowledged = None;
        self.expected.clear();
    }

    pub fn acknowledged(&self) -> Option<&Snapshot> {
        self.acknowledged.as_ref()
    }

    pub fn acknowledged_version(&self) -> Option<i32> {
        self.acknowledged.as_ref().map(Snapshot::version)
    }

    /// Sent snapshots not acknowledged yet, oldest first.
    pub fn expected(&self) -> impl Iterator<Item = &Snapshot> {
        self.expected.values()
    }

    pub fn has_expected(&self) -> bool {
        !self.expected.is_empty()
    }

    /// Move the marker to `version`. Expected snapshots up to `version` are
    /// consumed; skipping some of them is fine.
    pub fn advance(&mut self, version: i32) -> MarkerUpdate {
        if let Some(acknowledged) = self.acknowledged_version()
            && version < acknowledged
        {
            return MarkerUpdate::Stale { acknowledged };
        }

        let target = self
            .expected
            .get(&version)
            .cloned()
            .or_else(|| self.acknowledged.as_ref()?.walk_to(version))
            .or_else(|| self.expected.values().next()?.walk_to(version));
        let Some(target) = target else {
            return MarkerUpdate::Unknown;
        };

        self.expected = self.expected.split_off(&version.saturating_add(1));
        self.acknowledged = Some(target.clone());
        MarkerUpdate::Advanced(target)
    }
}

/// Outcome of one acknowledgement, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    Applied,
    Stale,
    Rejected,
}

impl Document {
    /// Apply every buffer version carried by a `fileParsed` or
    /// `analysisComplete` event.
    pub(crate) fn correlate(&self, kind: AckKind, event: &FileVersionsEvent) {
        for entry in &event.buffers {
            let outcome = self.acknowledge(entry.buffer_id, entry.version, kind);
            tracing::trace!(
                file = %self.path(),
                buffer = %entry.buffer_id,
                version = entry.version,
                ?kind,
                ?outcome,
                "acknowledgement"
            );
        }
    }

    pub(crate) fn acknowledge(&self, buffer_id: BufferId, version: i32, kind: AckKind) -> AckOutcome {
        let mut parsed = false;
        let mut analyzed = false;
        let outcome = {
            let mut state = self.state.lock();
            let Some(binding) = state.buffers.get_mut(&buffer_id) else {
                tracing::error!(file = %self.path(), buffer = %buffer_id, version, "acknowledgement for unknown buffer");
                return AckOutcome::Rejected;
            };

            let update = match kind {
                AckKind::Parse => binding.parse.advance(version),
                AckKind::Analysis => binding.analysis.advance(version),
            };
            match update {
                MarkerUpdate::Advanced(snapshot) => {
                    if kind == AckKind::Analysis {
                        binding.tracker.update_base(snapshot);
                        analyzed = true;
                    }
                    // Analysis implies parsing of the same version.
                    let parse_behind = binding
                        .parse
                        .acknowledged_version()
                        .is_none_or(|parsed| parsed < version);
                    if kind == AckKind::Parse {
                        parsed = true;
                    } else if parse_behind {
                        parsed = matches!(binding.parse.advance(version), MarkerUpdate::Advanced(_));
                    }
                    if parsed {
                        let settled = state.settle_parsed(buffer_id, version);
                        self.ctx.stats.settle(settled);
                    }
                    AckOutcome::Applied
                }
                MarkerUpdate::Stale { acknowledged } => {
                    self.ctx.stats.stale_responses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        file = %self.path(),
                        buffer = %buffer_id,
                        version,
                        acknowledged,
                        ?kind,
                        "stale acknowledgement ignored"
                    );
                    AckOutcome::Stale
                }
                MarkerUpdate::Unknown => {
                    tracing::error!(
                        file = %self.path(),
                        buffer = %buffer_id,
                        version,
                        ?kind,
                        "acknowledgement for a version that was never sent"
                    );
                    AckOutcome::Rejected
                }
            }
        };

        if parsed {
            self.publish_parse(buffer_id, version);
        }
        if analyzed {
            self.publish_analysis(buffer_id, version);
        }
        outcome
    }
}
