//! Binding table and device → artifact resolution.
//!
//! The in-memory table is what `resolve` reads; the catalog is written first
//! on every rebind so the two never disagree about a completed bind. Binds on
//! one scope are serialized by a per-scope async mutex held across the catalog
//! write. The table's `RwLock` itself is only held for the map lookup or swap.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use sea_orm::{sea_query::OnConflict, DatabaseConnection, EntityTrait, Set};
use serde::Serialize;
use tokio::sync::Mutex;

use super::{DeviceId, Scope};
use crate::artifact::{Artifact, ArtifactId, ArtifactStore};
use crate::db::entities::{self, target_binding};
use crate::error::{FirmwareError, Result};

/// The artifact currently assigned to a scope
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TargetBinding {
    pub scope: Scope,
    pub artifact_id: ArtifactId,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_by: Option<String>,
}

/// Outcome of resolving a device: the binding that applied and its artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub artifact: Artifact,
    pub binding: TargetBinding,
}

impl Resolution {
    pub fn scope(&self) -> &Scope {
        &self.binding.scope
    }
}

pub struct TargetingResolver {
    store: Arc<ArtifactStore>,
    table: Arc<BindingTable>,
}

/// Binding state shared with in-flight bind tasks
struct BindingTable {
    db: Arc<DatabaseConnection>,
    bindings: RwLock<HashMap<Scope, TargetBinding>>,
    bind_locks: DashMap<Scope, Arc<Mutex<()>>>,
}

impl TargetingResolver {
    /// Load all bindings from the catalog
    pub async fn open(store: Arc<ArtifactStore>, db: Arc<DatabaseConnection>) -> Result<Self> {
        let rows = entities::TargetBinding::find().all(db.as_ref()).await?;

        let mut bindings = HashMap::with_capacity(rows.len());
        for row in rows {
            match binding_from_row(&row) {
                Some(binding) if store.exists(&binding.artifact_id) => {
                    bindings.insert(binding.scope.clone(), binding);
                }
                Some(binding) => tracing::error!(
                    "Binding for {} points at unknown artifact {}, ignoring",
                    binding.scope,
                    binding.artifact_id
                ),
                None => tracing::error!("Ignoring malformed binding row {:?}", row),
            }
        }

        tracing::info!("Loaded {} target bindings from catalog", bindings.len());

        Ok(Self {
            store,
            table: Arc::new(BindingTable {
                db,
                bindings: RwLock::new(bindings),
                bind_locks: DashMap::new(),
            }),
        })
    }

    /// Resolve the artifact a device should run: its own binding if it has
    /// one, otherwise the global binding. `None` asks for the global binding.
    pub fn resolve(&self, device: Option<&DeviceId>) -> Result<Resolution> {
        let binding = {
            let table = self.table.bindings.read();
            device
                .and_then(|d| table.get(&Scope::Device(d.clone())))
                .or_else(|| table.get(&Scope::Global))
                .cloned()
        };

        let binding = binding.ok_or_else(|| {
            FirmwareError::NoFirmwareAvailable(match device {
                Some(d) => format!("device {}", d),
                None => "global scope".to_string(),
            })
        })?;

        let artifact = self.store.metadata(&binding.artifact_id)?;
        Ok(Resolution { artifact, binding })
    }

    /// Point `scope` at an existing artifact, replacing any previous binding.
    ///
    /// If the catalog write fails the previous binding stays in effect. The
    /// catalog write and the in-memory swap run in their own task, so a
    /// caller dropped mid-bind cannot leave the two disagreeing.
    pub async fn bind(
        &self,
        scope: Scope,
        artifact_id: ArtifactId,
        bound_by: Option<&str>,
    ) -> Result<TargetBinding> {
        if !self.store.exists(&artifact_id) {
            return Err(FirmwareError::NotFound(format!("artifact {}", artifact_id)));
        }

        let table = self.table.clone();
        let bound_by = bound_by.map(str::to_string);
        tokio::spawn(async move { table.bind(scope, artifact_id, bound_by).await })
            .await
            .map_err(|e| FirmwareError::Internal(format!("bind task aborted: {}", e)))?
    }

    /// The binding for exactly this scope, without fallback
    pub fn binding(&self, scope: &Scope) -> Option<TargetBinding> {
        self.table.bindings.read().get(scope).cloned()
    }

    /// All bindings, global first then devices by id
    pub fn bindings(&self) -> Vec<TargetBinding> {
        let mut all: Vec<TargetBinding> =
            self.table.bindings.read().values().cloned().collect();
        all.sort_by(|a, b| a.scope.cmp(&b.scope));
        all
    }
}

impl BindingTable {
    async fn bind(
        &self,
        scope: Scope,
        artifact_id: ArtifactId,
        bound_by: Option<String>,
    ) -> Result<TargetBinding> {
        let lock = self
            .bind_locks
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.bind_locked(scope.clone(), artifact_id, bound_by).await
        };

        drop(lock);
        self.bind_locks.remove_if(&scope, |_, l| Arc::strong_count(l) == 1);

        result
    }

    async fn bind_locked(
        &self,
        scope: Scope,
        artifact_id: ArtifactId,
        bound_by: Option<String>,
    ) -> Result<TargetBinding> {
        let previous = self.bindings.read().get(&scope).cloned();

        // Keep updated_at strictly increasing per scope even if the clock
        // stalls or steps back
        let mut updated_at = Utc::now().trunc_subsecs(6);
        if let Some(prev) = &previous {
            if updated_at <= prev.updated_at {
                updated_at = prev.updated_at + Duration::microseconds(1);
            }
        }

        let binding = TargetBinding {
            scope: scope.clone(),
            artifact_id,
            updated_at,
            bound_by,
        };

        self.persist(&binding).await?;
        self.bindings.write().insert(scope, binding.clone());

        match previous {
            Some(prev) if prev.artifact_id != artifact_id => tracing::info!(
                "Rebound {}: {} -> {}",
                binding.scope,
                prev.artifact_id,
                artifact_id
            ),
            Some(_) => tracing::info!("Refreshed {} binding to {}", binding.scope, artifact_id),
            None => tracing::info!("Bound {} to {}", binding.scope, artifact_id),
        }

        Ok(binding)
    }

    async fn persist(&self, binding: &TargetBinding) -> Result<()> {
        let model = target_binding::ActiveModel {
            scope: Set(binding.scope.storage_key()),
            artifact_id: Set(binding.artifact_id.to_hex()),
            updated_at: Set(binding.updated_at.timestamp_micros()),
            bound_by: Set(binding.bound_by.clone()),
        };

        entities::TargetBinding::insert(model)
            .on_conflict(
                OnConflict::column(target_binding::Column::Scope)
                    .update_columns([
                        target_binding::Column::ArtifactId,
                        target_binding::Column::UpdatedAt,
                        target_binding::Column::BoundBy,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;

        Ok(())
    }
}

fn binding_from_row(row: &target_binding::Model) -> Option<TargetBinding> {
    Some(TargetBinding {
        scope: Scope::from_storage_key(&row.scope)?,
        artifact_id: ArtifactId::from_hex(&row.artifact_id)?,
        updated_at: DateTime::from_timestamp_micros(row.updated_at)?,
        bound_by: row.bound_by.clone(),
    })
}
