use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use tandem_db::{CaptureWrite, Database};
use tandem_types::events::MomentEvent;
use tandem_types::models::{
    CapturedImage, FusionArtifactMeta, Moment, MomentStatus, Role,
};

use crate::config::CoordinatorConfig;
use crate::dedup::DeduplicationService;
use crate::error::MomentError;
use crate::fusion::{self, FusedArtifact, FusionError, PhotoFusionEngine, SourceFrame};
use crate::publish::TransitionPublisher;
use crate::storage::BlobStore;

/// Result of a `capture` call.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub moment: Moment,
    /// The capture credited to this request: the freshly stored record, or
    /// the existing one when `duplicate` is set.
    pub image: CapturedImage,
    pub duplicate: bool,
    pub fusion_enqueued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    Expired,
    /// The Moment reached a terminal state before the deadline fired.
    AlreadyTerminal,
}

/// Owner of the Moment state machine.
///
/// All status writes funnel through the version-conditioned primitives in
/// tandem-db; `capture` and `expire` race each other (and themselves, from
/// two devices) safely on that token. Fusion runs as a detached task and
/// never blocks or fails a committed transition.
///
/// Cloning is cheap (shared handles); detached tasks carry their own clone.
#[derive(Clone)]
pub struct MomentCoordinator {
    db: Arc<Database>,
    blobs: Arc<BlobStore>,
    dedup: DeduplicationService,
    fusion: Arc<PhotoFusionEngine>,
    publisher: Arc<dyn TransitionPublisher>,
    config: CoordinatorConfig,
}

impl MomentCoordinator {
    pub fn new(
        db: Arc<Database>,
        blobs: Arc<BlobStore>,
        fusion: Arc<PhotoFusionEngine>,
        publisher: Arc<dyn TransitionPublisher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            dedup: DeduplicationService::new(Arc::clone(&db)),
            db,
            blobs,
            fusion,
            publisher,
            config,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run a database closure off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, MomentError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| MomentError::Internal(anyhow::anyhow!("spawn_blocking join error: {e}")))?
            .map_err(MomentError::Internal)
    }

    async fn load_moment(&self, moment_id: Uuid) -> Result<Moment, MomentError> {
        self.blocking(move |db| db.get_moment(moment_id))
            .await?
            .ok_or(MomentError::NotFound { what: "moment" })
    }

    /// Open a new Moment in `PENDING` with `expires_at = now + ttl`.
    pub async fn initiate(
        &self,
        couple_id: Uuid,
        initiator_id: Uuid,
        memory_id: Option<Uuid>,
        ttl: Option<chrono::Duration>,
    ) -> Result<Moment, MomentError> {
        let couple = self
            .blocking(move |db| db.get_couple(couple_id))
            .await?
            .ok_or(MomentError::NotFound { what: "couple" })?;
        let participant = couple
            .other_partner(initiator_id)
            .ok_or(MomentError::Forbidden)?;

        let now = Utc::now();
        let ttl = self.config.clamp_ttl(ttl);
        let moment = Moment {
            id: Uuid::new_v4(),
            couple_id,
            initiator_id,
            participant_id: Some(participant),
            memory_id,
            status: MomentStatus::Pending,
            captured_by: None,
            created_at: now,
            expires_at: now + ttl,
            completed_at: None,
            combined_image_path: None,
            fusion_meta: None,
            version: 0,
        };

        let insert = moment.clone();
        let limit = self.config.max_active_per_couple;
        let created = self
            .blocking(move |db| db.create_moment_checked(&insert, limit))
            .await?;
        if !created {
            return Err(MomentError::Capacity { limit });
        }

        info!(
            "Moment {} initiated by {} for couple {} (expires {})",
            moment.id, initiator_id, couple_id, moment.expires_at
        );
        self.publisher.publish(MomentEvent::Initiated {
            moment_id: moment.id,
            couple_id,
            initiator: initiator_id,
            expires_at: moment.expires_at,
        });

        Ok(moment)
    }

    /// Submit one partner's photo against a Moment.
    ///
    /// Duplicate content short-circuits to the existing capture (success-
    /// shaped). A capture that lands while the other partner's photo is
    /// already stored auto-completes the Moment and detaches a fusion job.
    pub async fn capture(
        &self,
        moment_id: Uuid,
        user_id: Uuid,
        bytes: Vec<u8>,
    ) -> Result<CaptureOutcome, MomentError> {
        let moment = self.load_moment(moment_id).await?;
        self.check_window_and_role(&moment, user_id, Utc::now())?;

        // Couple-scoped duplicate check before anything is stored.
        let svc = self.dedup.clone();
        let couple_id = moment.couple_id;
        let (checked, bytes) = tokio::task::spawn_blocking(move || {
            let outcome = svc.check_and_register(couple_id, &bytes);
            (outcome, bytes)
        })
        .await
        .map_err(|e| MomentError::Internal(anyhow::anyhow!("spawn_blocking join error: {e}")))?;
        let checked = checked?;
        if let Some(existing) = checked.existing {
            info!(
                "Capture for moment {} matched existing content {} (confidence {})",
                moment_id, existing.digest, checked.confidence
            );
            return Ok(CaptureOutcome {
                moment,
                image: existing,
                duplicate: true,
                fusion_enqueued: false,
            });
        }

        // Intake: header probe, EXIF provenance, digest-addressed blob.
        let ((width, height), ext) = fusion::probe_image(&bytes)?;
        let exif = fusion::read_exif(&bytes);
        let path = BlobStore::capture_path(couple_id, &checked.digest, ext);
        self.blobs
            .save(&path, &bytes)
            .await
            .map_err(MomentError::Storage)?;

        let mut current = moment;
        let attempts = self.config.write_retry_limit;
        for attempt in 1..=attempts {
            if attempt > 1 {
                current = self.load_moment(moment_id).await?;
            }
            let now = Utc::now();
            let role = self.check_window_and_role(&current, user_id, now)?;

            if current.status == MomentStatus::Completed {
                // Only a capture that lost the conditional write gets the
                // observed-completed treatment: if this user's photo is on
                // record the request already succeeded through the racing
                // flight, so fold into a no-op returning the completed
                // Moment. A fresh capture against a completed Moment is an
                // invalid transition.
                if attempt > 1 {
                    let captures = self
                        .blocking(move |db| db.captures_for_moment(moment_id))
                        .await?;
                    if let Some(own) = captures.into_iter().find(|c| c.user_id == user_id) {
                        return Ok(CaptureOutcome {
                            moment: current,
                            image: own,
                            duplicate: false,
                            fusion_enqueued: false,
                        });
                    }
                }
                return Err(MomentError::InvalidTransition {
                    from: current.status,
                    requested: role.captured_status(),
                });
            }

            let requested = role.captured_status();
            if !current.status.can_transition_to(requested) {
                return Err(MomentError::InvalidTransition {
                    from: current.status,
                    requested,
                });
            }

            // Both partners have now captured.
            let auto_complete = matches!(
                (current.status, requested),
                (MomentStatus::Partner1Captured, MomentStatus::Partner2Captured)
                    | (MomentStatus::Partner2Captured, MomentStatus::Partner1Captured)
            );
            let (next, completed_at) = if auto_complete {
                (MomentStatus::Completed, Some(now))
            } else {
                (requested, None)
            };

            let image = CapturedImage {
                id: Uuid::new_v4(),
                moment_id,
                couple_id,
                user_id,
                path: path.clone(),
                digest: checked.digest.clone(),
                width,
                height,
                exif: exif.clone(),
                captured_at: now,
            };

            let expected_version = current.version;
            let write_image = image.clone();
            let write = self
                .blocking(move |db| {
                    db.apply_capture(
                        moment_id,
                        expected_version,
                        next,
                        user_id,
                        completed_at,
                        &write_image,
                    )
                })
                .await?;

            match write {
                CaptureWrite::Applied => {
                    let mut updated = current;
                    updated.status = next;
                    updated.captured_by = Some(user_id);
                    updated.completed_at = completed_at.or(updated.completed_at);
                    updated.version += 1;

                    info!(
                        "Moment {} -> {} (captured by {})",
                        moment_id,
                        next.as_str(),
                        user_id
                    );

                    let fusion_enqueued = next == MomentStatus::Completed;
                    if fusion_enqueued {
                        self.publisher.publish(MomentEvent::Completed {
                            moment_id,
                            couple_id,
                            combined_image: None,
                        });
                        let this = self.clone();
                        tokio::spawn(async move { this.fusion_with_retry(moment_id).await });
                    } else {
                        self.publisher.publish(MomentEvent::PartnerCaptured {
                            moment_id,
                            couple_id,
                            actor_id: user_id,
                        });
                    }

                    return Ok(CaptureOutcome {
                        moment: updated,
                        image,
                        duplicate: false,
                        fusion_enqueued,
                    });
                }
                CaptureWrite::VersionConflict => {
                    warn!(
                        "Capture write for moment {} lost the race (attempt {}/{})",
                        moment_id, attempt, attempts
                    );
                    continue;
                }
                CaptureWrite::DuplicateContent { existing } => {
                    // Identical bytes landed concurrently; hand back theirs.
                    return Ok(CaptureOutcome {
                        moment: current,
                        image: existing,
                        duplicate: true,
                        fusion_enqueued: false,
                    });
                }
            }
        }

        Err(MomentError::ConcurrencyConflict { attempts })
    }

    /// Deadline transition, invoked by the expiration scheduler. A no-op for
    /// Moments that reached a terminal state first.
    pub async fn expire(&self, moment_id: Uuid) -> Result<ExpireOutcome, MomentError> {
        let attempts = self.config.write_retry_limit;
        for _ in 0..attempts {
            let moment = self.load_moment(moment_id).await?;
            if moment.status.is_terminal() {
                return Ok(ExpireOutcome::AlreadyTerminal);
            }

            let expected_version = moment.version;
            let applied = self
                .blocking(move |db| {
                    db.transition_moment(
                        moment_id,
                        expected_version,
                        MomentStatus::Expired,
                        None,
                        None,
                    )
                })
                .await?;

            if applied {
                info!("Moment {} expired", moment_id);
                self.publisher.publish(MomentEvent::Expired {
                    moment_id,
                    couple_id: moment.couple_id,
                });
                return Ok(ExpireOutcome::Expired);
            }
            // Someone moved the Moment under us; re-read and decide again.
        }
        Err(MomentError::ConcurrencyConflict { attempts })
    }

    fn check_window_and_role(
        &self,
        moment: &Moment,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Role, MomentError> {
        if moment.status == MomentStatus::Expired || moment.is_expired_at(now) {
            return Err(MomentError::Expired {
                expires_at: moment.expires_at,
            });
        }
        moment.role_of(user_id).ok_or(MomentError::Forbidden)
    }

    /// One fusion pass: decode both captures, composite, store, attach.
    ///
    /// Idempotent: a Moment that already has its artifact returns Ok
    /// without touching anything.
    pub async fn fuse_moment(&self, moment_id: Uuid) -> Result<(), MomentError> {
        let moment = self.load_moment(moment_id).await?;
        if moment.status != MomentStatus::Completed {
            return Err(MomentError::Internal(anyhow::anyhow!(
                "fusion requested for moment {} in state {}",
                moment_id,
                moment.status.as_str()
            )));
        }
        if moment.combined_image_path.is_some() {
            return Ok(());
        }

        let captures = self
            .blocking(move |db| db.captures_for_moment(moment_id))
            .await?;
        if captures.len() != 2 {
            return Err(FusionError::WrongCaptureCount(captures.len()).into());
        }

        // Initiator's frame first for provenance; the layout is symmetric.
        let mut ordered = captures;
        ordered.sort_by_key(|c| c.user_id != moment.initiator_id);

        let mut inputs = Vec::with_capacity(2);
        for capture in ordered {
            let role = moment
                .role_of(capture.user_id)
                .ok_or_else(|| anyhow::anyhow!("capture {} by non-participant", capture.id))?;
            let blob = self
                .blobs
                .read(&capture.path)
                .await
                .map_err(MomentError::Storage)?;
            inputs.push((capture, role, blob));
        }

        let engine = Arc::clone(&self.fusion);
        let artifact: Result<FusedArtifact, FusionError> =
            tokio::task::spawn_blocking(move || {
                let mut frames = Vec::with_capacity(2);
                for (capture, role, blob) in &inputs {
                    frames.push(SourceFrame {
                        image: fusion::decode_image(blob)?,
                        user_id: capture.user_id,
                        role: *role,
                        source_path: capture.path.clone(),
                        captured_at: capture.captured_at,
                        exif: capture.exif.clone(),
                    });
                }
                let (second, first) = (frames.pop(), frames.pop());
                match (first, second) {
                    (Some(a), Some(b)) => engine.fuse(&a, &b),
                    _ => Err(FusionError::WrongCaptureCount(0)),
                }
            })
            .await
            .map_err(|e| MomentError::Internal(anyhow::anyhow!("spawn_blocking join error: {e}")))?;
        let artifact = artifact?;

        let ext = self.fusion.config().format.ext();
        let fused_rel = BlobStore::fused_path(moment.couple_id, moment.id, ext);
        let thumb_rel = BlobStore::thumb_path(moment.couple_id, moment.id, ext);
        self.blobs
            .save(&fused_rel, &artifact.bytes)
            .await
            .map_err(MomentError::Storage)?;
        self.blobs
            .save(&thumb_rel, &artifact.thumbnail)
            .await
            .map_err(MomentError::Storage)?;

        let meta = FusionArtifactMeta {
            moment_id,
            layout: artifact.layout,
            width: artifact.width,
            height: artifact.height,
            thumbnail_path: thumb_rel,
            created_at: Utc::now(),
            sources: artifact.sources,
        };
        let meta_json =
            serde_json::to_string(&meta).map_err(|e| MomentError::Internal(e.into()))?;

        let path_for_db = fused_rel.clone();
        let attached = self
            .blocking(move |db| db.set_combined_image(moment_id, &path_for_db, &meta_json))
            .await?;
        if attached {
            info!(
                "Moment {} fused into {} ({}x{})",
                moment_id, fused_rel, artifact.width, artifact.height
            );
        } else {
            warn!("Fused artifact for moment {} was already attached", moment_id);
        }

        Ok(())
    }

    /// Detached fusion driver: bounded retries, then parked as failed-fusion.
    /// The Moment stays `COMPLETED` either way.
    pub async fn fusion_with_retry(self, moment_id: Uuid) {
        let limit = self.config.fusion_retry_limit;
        for attempt in 1..=limit {
            match self.fuse_moment(moment_id).await {
                Ok(()) => return,
                Err(e) if attempt < limit => {
                    warn!(
                        "Fusion attempt {}/{} for moment {} failed: {}",
                        attempt, limit, moment_id, e
                    );
                    tokio::time::sleep(self.config.fusion_retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "Fusion for moment {} failed permanently after {} attempts: {}",
                        moment_id, limit, e
                    );
                }
            }
        }
    }
}
