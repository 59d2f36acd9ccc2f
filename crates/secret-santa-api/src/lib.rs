use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use secret_santa_core::{
    compute_assignment_with_rng, sanitize_conflicts, Assignment, FailureKind, PairingError,
    ParticipantId, SearchStats,
};
use secret_santa_store_sqlite::{CommitStatus, ParticipantRecord, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub use secret_santa_core::PairingConfig;

pub const API_CONTRACT_VERSION: &str = "api.v1";

const ALREADY_LOCKED_MESSAGE: &str = "Pairing already completed. Cannot trigger again.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthenticated,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    fn internal(err: &anyhow::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("{err:#}"))
    }

    fn pairing_fault(err: &anyhow::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("Pairing failed: {err:#}"))
    }
}

impl From<PairingError> for ApiError {
    fn from(err: PairingError) -> Self {
        match err {
            PairingError::Rejected(failure) => {
                let code = if failure.kind == FailureKind::SearchExhausted {
                    ErrorCode::ResourceExhausted
                } else {
                    ErrorCode::FailedPrecondition
                };
                Self::new(code, failure.detail)
            }
            PairingError::Config(message) => {
                Self::new(ErrorCode::InvalidArgument, format!("invalid pairing config: {message}"))
            }
            PairingError::InvariantViolation(message) => Self::new(
                ErrorCode::Internal,
                format!("Pairing failed: internal consistency fault: {message}"),
            ),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Identity of whoever is calling, as asserted by the fronting auth layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caller {
    pub email: Option<String>,
}

impl Caller {
    #[must_use]
    pub fn anonymous() -> Self {
        Self { email: None }
    }

    #[must_use]
    pub fn with_email(email: impl Into<String>) -> Self {
        Self { email: Some(email.into()) }
    }

    /// Participant id derived from the email's local part.
    ///
    /// # Errors
    /// `UNAUTHENTICATED` without an email, `INVALID_ARGUMENT` when it is not
    /// shaped like `user@domain`.
    pub fn participant_id(&self) -> ApiResult<String> {
        let email = self
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .ok_or_else(|| ApiError::new(ErrorCode::Unauthenticated, "User must be authenticated"))?;

        match email.split_once('@') {
            Some((user, domain)) if !user.is_empty() && !domain.is_empty() => Ok(user.to_string()),
            _ => Err(ApiError::new(ErrorCode::InvalidArgument, "Invalid user email format")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterParticipantRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub conflicts: Value,
    #[serde(default)]
    pub wishlist: String,
}

/// Directory entry. Giftees stay private; only whether one is set is shown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantSummary {
    pub id: String,
    pub name: String,
    pub is_admin: bool,
    pub conflicts: Vec<ParticipantId>,
    pub wishlist: String,
    pub has_giftee: bool,
}

impl From<ParticipantRecord> for ParticipantSummary {
    fn from(record: ParticipantRecord) -> Self {
        let conflicts = sanitize_conflicts(&ParticipantId::new(record.id.as_str()), &record.conflicts);
        Self {
            id: record.id,
            name: record.name,
            is_admin: record.is_admin,
            conflicts,
            wishlist: record.wishlist,
            has_giftee: record.giftee_id.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WishlistUpdate {
    pub participant_id: String,
    pub wishlist: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GifteeView {
    pub id: String,
    pub name: String,
    pub wishlist: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingStatus {
    pub locked: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub lock_in_time: Option<OffsetDateTime>,
    pub participant_count: usize,
    pub paired_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerPairingResult {
    pub message: String,
    pub pairings_count: usize,
    pub warnings: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub locked_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingPreview {
    pub assignment: Assignment,
    pub warnings: Vec<String>,
    pub stats: SearchStats,
}

#[derive(Debug, Clone)]
pub struct SecretSantaApi {
    db_path: PathBuf,
    config: PairingConfig,
}

impl SecretSantaApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: PairingConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    fn open_store(&self) -> ApiResult<SqliteStore> {
        SqliteStore::open(&self.db_path).map_err(|err| ApiError::internal(&err))
    }

    fn open_migrated_store(&self) -> ApiResult<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate().map_err(|err| ApiError::internal(&err))?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns `INTERNAL` when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> ApiResult<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status().map_err(|err| ApiError::internal(&err))
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns `INTERNAL` when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status().map_err(|err| ApiError::internal(&err))?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate().map_err(|err| ApiError::internal(&err))?;
        let after = store.schema_status().map_err(|err| ApiError::internal(&err))?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Add a participant or update their profile.
    ///
    /// # Errors
    /// Returns `INVALID_ARGUMENT` for a blank id or name, or an id containing `@`.
    pub fn register_participant(
        &self,
        request: RegisterParticipantRequest,
    ) -> ApiResult<ParticipantSummary> {
        let id = request.id.trim().to_string();
        if id.is_empty() || id.contains('@') {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "participant id MUST be a non-empty email local part",
            ));
        }
        if request.name.trim().is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidArgument, "participant name MUST be provided"));
        }

        let mut store = self.open_migrated_store()?;
        let record = ParticipantRecord {
            id: id.clone(),
            name: request.name.trim().to_string(),
            is_admin: request.is_admin,
            conflicts: request.conflicts,
            wishlist: request.wishlist,
            giftee_id: None,
        };
        store.upsert_participant(&record).map_err(|err| ApiError::internal(&err))?;

        let stored = store
            .get_participant(&id)
            .map_err(|err| ApiError::internal(&err))?
            .ok_or_else(|| ApiError::new(ErrorCode::Internal, format!("participant {id} vanished after write")))?;
        Ok(stored.into())
    }

    /// # Errors
    /// Returns `INTERNAL` when the store cannot be read.
    pub fn list_participants(&self) -> ApiResult<Vec<ParticipantSummary>> {
        let store = self.open_migrated_store()?;
        let records = store.list_participants().map_err(|err| ApiError::internal(&err))?;
        Ok(records.into_iter().map(ParticipantSummary::from).collect())
    }

    /// Replace the caller's own wishlist.
    ///
    /// # Errors
    /// Returns identity errors from [`Caller::participant_id`], or `NOT_FOUND`
    /// when the caller is not registered.
    pub fn update_wishlist(&self, caller: &Caller, wishlist: &str) -> ApiResult<WishlistUpdate> {
        let participant_id = caller.participant_id()?;
        let mut store = self.open_migrated_store()?;
        let updated = store
            .set_wishlist(&participant_id, wishlist)
            .map_err(|err| ApiError::internal(&err))?;
        if !updated {
            return Err(ApiError::new(
                ErrorCode::NotFound,
                format!("participant {participant_id} is not registered"),
            ));
        }
        Ok(WishlistUpdate { participant_id, wishlist: wishlist.to_string() })
    }

    /// The caller's giftee, or `None` before pairing has run.
    ///
    /// # Errors
    /// Returns identity errors, `NOT_FOUND` for an unregistered caller, or
    /// `INTERNAL` when the stored giftee no longer exists.
    pub fn my_giftee(&self, caller: &Caller) -> ApiResult<Option<GifteeView>> {
        let participant_id = caller.participant_id()?;
        let store = self.open_migrated_store()?;
        let me = store
            .get_participant(&participant_id)
            .map_err(|err| ApiError::internal(&err))?
            .ok_or_else(|| {
                ApiError::new(ErrorCode::NotFound, format!("participant {participant_id} is not registered"))
            })?;

        let Some(giftee_id) = me.giftee_id else {
            return Ok(None);
        };
        let giftee = store
            .get_participant(&giftee_id)
            .map_err(|err| ApiError::internal(&err))?
            .ok_or_else(|| {
                ApiError::new(ErrorCode::Internal, format!("assigned giftee {giftee_id} no longer exists"))
            })?;
        Ok(Some(GifteeView { id: giftee.id, name: giftee.name, wishlist: giftee.wishlist }))
    }

    /// # Errors
    /// Returns `INTERNAL` when the store cannot be read.
    pub fn pairing_status(&self) -> ApiResult<PairingStatus> {
        let store = self.open_migrated_store()?;
        let lock_in_time = store.pairing_lock().map_err(|err| ApiError::internal(&err))?;
        let counts = store.pairing_counts().map_err(|err| ApiError::internal(&err))?;
        Ok(PairingStatus {
            locked: lock_in_time.is_some(),
            lock_in_time,
            participant_count: counts.participant_count,
            paired_count: counts.paired_count,
        })
    }

    /// Compute a pairing for the current roster without saving it.
    ///
    /// # Errors
    /// Returns the same errors as [`SecretSantaApi::trigger_pairing`], except
    /// that an existing lock does not block a preview.
    pub fn preview_pairing(&self, caller: &Caller, seed: Option<u64>) -> ApiResult<PairingPreview> {
        let store = self.open_migrated_store()?;
        authorize_admin(&store, caller)?;

        let candidates = store.list_pairing_candidates().map_err(|err| ApiError::pairing_fault(&err))?;
        let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let outcome = compute_assignment_with_rng(&candidates, &self.config, &mut rng)?;
        Ok(PairingPreview {
            warnings: outcome.warning_messages(),
            assignment: outcome.assignment,
            stats: outcome.stats,
        })
    }

    /// Run the one-shot pairing: authorise, compute, then persist every giftee
    /// and the lock atomically.
    ///
    /// # Errors
    /// `UNAUTHENTICATED`/`INVALID_ARGUMENT`/`PERMISSION_DENIED` for identity
    /// problems, `FAILED_PRECONDITION` when already locked or when the roster
    /// cannot be paired, `RESOURCE_EXHAUSTED` when the search cap is hit, and
    /// `INTERNAL` for store or consistency faults.
    pub fn trigger_pairing(&self, caller: &Caller) -> ApiResult<TriggerPairingResult> {
        let mut store = self.open_migrated_store()?;
        let admin_id = authorize_admin(&store, caller)?;

        if store.pairing_lock().map_err(|err| ApiError::pairing_fault(&err))?.is_some() {
            return Err(ApiError::new(ErrorCode::FailedPrecondition, ALREADY_LOCKED_MESSAGE));
        }

        let candidates = store.list_pairing_candidates().map_err(|err| ApiError::pairing_fault(&err))?;
        let mut rng = StdRng::from_entropy();
        let outcome = compute_assignment_with_rng(&candidates, &self.config, &mut rng).map_err(|err| {
            tracing::warn!(admin = %admin_id, error = %err, "pairing trigger rejected");
            ApiError::from(err)
        })?;

        let locked_at = OffsetDateTime::now_utc();
        let status = store
            .commit_assignment(&outcome.assignment, locked_at)
            .map_err(|err| ApiError::pairing_fault(&err))?;
        if status == CommitStatus::AlreadyLocked {
            return Err(ApiError::new(ErrorCode::FailedPrecondition, ALREADY_LOCKED_MESSAGE));
        }

        tracing::info!(
            admin = %admin_id,
            pairings = outcome.assignment.len(),
            warnings = outcome.warnings.len(),
            "pairing triggered"
        );
        Ok(TriggerPairingResult {
            message: "Pairing completed successfully".to_string(),
            pairings_count: outcome.assignment.len(),
            warnings: outcome.warning_messages(),
            locked_at,
        })
    }
}

/// Load pairing tunables from an optional YAML file, then apply overrides.
///
/// A missing path yields the defaults. An override cap replaces whatever the
/// file set.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, or the resulting
/// config is invalid.
pub fn load_pairing_config(
    path: Option<&Path>,
    max_placements: Option<u64>,
) -> anyhow::Result<PairingConfig> {
    let mut config = match path {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read pairing config {}", path.display()))?;
            if body.trim().is_empty() {
                PairingConfig::default()
            } else {
                serde_yaml::from_str(&body)
                    .with_context(|| format!("failed to parse pairing config {}", path.display()))?
            }
        }
        None => PairingConfig::default(),
    };
    if max_placements.is_some() {
        config = config.with_max_placements(max_placements);
    }
    config.validate()?;
    Ok(config)
}

fn authorize_admin(store: &SqliteStore, caller: &Caller) -> ApiResult<String> {
    let user_id = caller.participant_id()?;
    let user = store
        .get_participant(&user_id)
        .map_err(|err| ApiError::pairing_fault(&err))?
        .ok_or_else(|| ApiError::new(ErrorCode::PermissionDenied, "User document not found"))?;
    if !user.is_admin {
        return Err(ApiError::new(ErrorCode::PermissionDenied, "Only admin users can trigger pairing"));
    }
    Ok(user_id)
}
