//! Tool schema building and caching.
//!
//! Schemas are derived from the live capability inventory and cached with
//! a short time-to-live, because the underlying capability set can change
//! while the process runs. The cache is rebuilt lazily on the first call
//! after expiry, never eagerly at startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::types::{CapabilitySnapshot, ToolSchema};

/// Build one schema per (domain, action) pair in the snapshot.
///
/// The tool name is `domain_action`; the parameters schema declares a
/// `targets` array constrained to the domain's exposed target ids plus a
/// free-form `parameters` object for action-specific fields.
pub fn build_schemas(capabilities: &CapabilitySnapshot) -> Vec<ToolSchema> {
    let mut schemas = Vec::new();

    for (domain, caps) in &capabilities.domains {
        let targets: Vec<&String> = caps.targets.iter().collect();
        for (action, description) in &caps.actions {
            let mut target_items = json!({"type": "string"});
            if !targets.is_empty() {
                target_items = json!({"type": "string", "enum": &targets});
            }

            schemas.push(ToolSchema {
                name: format!("{}_{}", domain, action),
                description: description.clone(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "targets": {
                            "type": "array",
                            "items": target_items,
                            "description": format!("Targets in the '{}' domain to act on", domain),
                        },
                        "parameters": {
                            "type": "object",
                            "description": "Additional action parameters",
                        },
                    },
                }),
            });
        }
    }

    debug!(
        schemas = schemas.len(),
        domains = capabilities.domains.len(),
        "Built tool schemas"
    );
    schemas
}

struct CacheEntry {
    schemas: Arc<Vec<ToolSchema>>,
    built_at: Instant,
}

/// TTL-bounded cache for the declared tool schemas.
///
/// Process-wide, read-mostly: readers get cheap `Arc` clones, and a
/// rebuild happens under the single cache lock so at most one writer runs
/// at a time.
pub struct SchemaCache {
    ttl: Duration,
    entry: Mutex<Option<CacheEntry>>,
    builds: AtomicU64,
}

impl SchemaCache {
    /// Create a cache with the given time-to-live.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
            builds: AtomicU64::new(0),
        }
    }

    /// Return the cached schemas, rebuilding from the snapshot when the
    /// cache is empty or expired.
    pub async fn get_or_build(&self, capabilities: &CapabilitySnapshot) -> Arc<Vec<ToolSchema>> {
        let mut entry = self.entry.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.built_at.elapsed() < self.ttl {
                debug!(schemas = cached.schemas.len(), "Using cached tool schemas");
                return Arc::clone(&cached.schemas);
            }
        }

        let schemas = Arc::new(build_schemas(capabilities));
        self.builds.fetch_add(1, Ordering::Relaxed);
        info!(schemas = schemas.len(), "Rebuilt tool schema cache");

        *entry = Some(CacheEntry {
            schemas: Arc::clone(&schemas),
            built_at: Instant::now(),
        });
        schemas
    }

    /// Drop the cached entry so the next call rebuilds.
    pub async fn invalidate(&self) {
        let mut entry = self.entry.lock().await;
        *entry = None;
        info!("Tool schema cache invalidated");
    }

    /// Number of rebuilds performed. Instrumentation for cache tests.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}
