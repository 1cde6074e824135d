//! Statistics over finished jobs.
//!
//! A [`StatsSnapshot`] is never stored. It is folded from the job records on
//! every request, so it cannot drift from the store.

use crate::decision::StreamAction;
use crate::job::{current_timestamp_ms, Job, JobId, JobState};
use crate::store::{JobFilter, JobStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Length of [`StatsSnapshot::top_space_savers`].
pub const TOP_SPACE_SAVERS: usize = 10;

/// Totals for one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileStats {
    pub completed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_processing_ms: f64,
}

/// Totals for one target video codec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecStats {
    pub completed: u64,
    pub avg_processing_ms: f64,
}

/// A completed job that shrank its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceSaver {
    pub job_id: JobId,
    pub source_path: PathBuf,
    pub profile: String,
    pub bytes_saved: u64,
}

/// Aggregate counters derived from terminal jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub timestamp_unix_ms: i64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Completed jobs that never ran the encoder; included in `completed`.
    pub dry_run: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub bytes_saved: i64,
    pub space_saved_percent: f64,
    /// Mean of input size / output size across measured jobs.
    pub avg_compression_ratio: f64,
    pub avg_processing_ms: f64,
    pub profiles: BTreeMap<String, ProfileStats>,
    /// Keyed by target video codec; `copy` when the video was carried over.
    pub codecs: BTreeMap<String, CodecStats>,
    /// Largest savings first.
    pub top_space_savers: Vec<SpaceSaver>,
}

impl StatsSnapshot {
    pub fn total_finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

/// Running mean of processing times.
#[derive(Default)]
struct MeanMs {
    sum: i64,
    count: u64,
}

impl MeanMs {
    fn add(&mut self, ms: Option<i64>) {
        if let Some(ms) = ms {
            self.sum += ms;
            self.count += 1;
        }
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

fn target_video_codec(job: &Job) -> String {
    match &job.plan.video {
        StreamAction::Reencode { codec } => codec.clone(),
        StreamAction::Copy => "copy".to_string(),
        StreamAction::Drop => "none".to_string(),
    }
}

/// Fold `jobs` into a snapshot. Non-terminal jobs are ignored.
///
/// Only completed, non-dry-run jobs with both sizes known contribute bytes.
pub fn compute_stats(jobs: &[Job]) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot {
        timestamp_unix_ms: current_timestamp_ms(),
        ..StatsSnapshot::default()
    };
    let mut ratio_sum = 0.0;
    let mut ratio_count = 0u64;
    let mut processing = MeanMs::default();
    let mut profile_processing: BTreeMap<String, MeanMs> = BTreeMap::new();
    let mut codec_processing: BTreeMap<String, MeanMs> = BTreeMap::new();

    for job in jobs.iter().filter(|j| j.is_terminal()) {
        match job.state {
            JobState::Completed => snapshot.completed += 1,
            JobState::Failed => snapshot.failed += 1,
            JobState::Cancelled => snapshot.cancelled += 1,
            JobState::Pending | JobState::Running => continue,
        }
        processing.add(job.duration_ms());

        if job.state != JobState::Completed {
            continue;
        }
        let Some(result) = &job.result else { continue };
        if result.dry_run {
            snapshot.dry_run += 1;
            continue;
        }

        let codec = target_video_codec(job);
        snapshot.codecs.entry(codec.clone()).or_default().completed += 1;
        codec_processing.entry(codec).or_default().add(job.duration_ms());

        let (Some(bytes_in), Some(bytes_out)) = (result.bytes_before, result.bytes_after) else {
            continue;
        };

        snapshot.total_bytes_in += bytes_in;
        snapshot.total_bytes_out += bytes_out;
        if bytes_out > 0 {
            ratio_sum += bytes_in as f64 / bytes_out as f64;
            ratio_count += 1;
        }
        if bytes_in > bytes_out {
            snapshot.top_space_savers.push(SpaceSaver {
                job_id: job.id.clone(),
                source_path: job.source_path.clone(),
                profile: job.profile.clone(),
                bytes_saved: bytes_in - bytes_out,
            });
        }

        let profile = snapshot.profiles.entry(job.profile.clone()).or_default();
        profile.completed += 1;
        profile.bytes_in += bytes_in;
        profile.bytes_out += bytes_out;
        profile_processing
            .entry(job.profile.clone())
            .or_default()
            .add(job.duration_ms());
    }

    snapshot.bytes_saved = snapshot.total_bytes_in as i64 - snapshot.total_bytes_out as i64;
    if snapshot.total_bytes_in > 0 {
        snapshot.space_saved_percent =
            snapshot.bytes_saved as f64 / snapshot.total_bytes_in as f64 * 100.0;
    }
    if ratio_count > 0 {
        snapshot.avg_compression_ratio = ratio_sum / ratio_count as f64;
    }
    snapshot.avg_processing_ms = processing.mean();
    for (name, profile) in snapshot.profiles.iter_mut() {
        if let Some(mean) = profile_processing.get(name) {
            profile.avg_processing_ms = mean.mean();
        }
    }
    for (name, codec) in snapshot.codecs.iter_mut() {
        if let Some(mean) = codec_processing.get(name) {
            codec.avg_processing_ms = mean.mean();
        }
    }

    snapshot
        .top_space_savers
        .sort_by(|a, b| b.bytes_saved.cmp(&a.bytes_saved).then_with(|| a.job_id.cmp(&b.job_id)));
    snapshot.top_space_savers.truncate(TOP_SPACE_SAVERS);
    snapshot
}

/// Read-only view of the store that produces snapshots on demand.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn JobStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn snapshot(&self) -> Result<StatsSnapshot, StoreError> {
        let jobs = self.store.list(&JobFilter::finished())?;
        Ok(compute_stats(&jobs))
    }
}
