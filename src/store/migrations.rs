//! Schema migrations for the cluster store document.
//!
//! Each step is a pure function over the raw JSON document. Steps run in
//! ascending version order, starting after the version recorded in the file,
//! and every step must accept anything an older build could have written.

use serde_json::{Map, Value};

use crate::error::MigrationError;

pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

pub type MigrateFn = fn(Value) -> Result<Value, String>;

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub migrate: MigrateFn,
}

/// Migration chain of the cluster store, oldest first.
pub const CLUSTER_STORE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "clusters-as-list",
        migrate: clusters_as_list,
    },
    Migration {
        version: 2,
        name: "preferences-bag",
        migrate: preferences_bag,
    },
    Migration {
        version: 3,
        name: "accessible-namespaces-list",
        migrate: accessible_namespaces_list,
    },
];

/// Outcome of running a chain over one document.
#[derive(Debug)]
pub struct Migrated {
    pub document: Value,
    pub from_version: u32,
    pub applied: Vec<u32>,
}

pub fn latest_version(migrations: &[Migration]) -> u32 {
    migrations.last().map(|m| m.version).unwrap_or(0)
}

/// Reads `schemaVersion`; an absent key means a pre-versioning document.
pub fn schema_version(doc: &Value) -> Result<u32, String> {
    match doc.get(SCHEMA_VERSION_KEY) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| format!("`{SCHEMA_VERSION_KEY}` is not a version number: {v}")),
    }
}

/// Applies every migration newer than the document's version.
pub fn migrate(mut doc: Value, migrations: &[Migration]) -> Result<Migrated, MigrationError> {
    let from_version = schema_version(&doc).map_err(|reason| MigrationError {
        version: 0,
        name: "read-version",
        reason,
    })?;

    let mut applied = Vec::new();
    for step in migrations.iter().filter(|m| m.version > from_version) {
        let fail = |reason: String| MigrationError {
            version: step.version,
            name: step.name,
            reason,
        };
        doc = (step.migrate)(doc).map_err(fail)?;
        doc.as_object_mut()
            .ok_or_else(|| fail("migration produced a non-object document".into()))?
            .insert(SCHEMA_VERSION_KEY.into(), Value::from(step.version));
        log::info!("store: applied migration {} ({})", step.version, step.name);
        applied.push(step.version);
    }

    Ok(Migrated {
        document: doc,
        from_version,
        applied,
    })
}

fn document_object(doc: &mut Value) -> Result<&mut Map<String, Value>, String> {
    doc.as_object_mut()
        .ok_or_else(|| "document is not an object".to_string())
}

/// Runs `f` over every cluster entry that is an object. Other entries are
/// left for the registry to reject one by one.
fn for_each_cluster(doc: &mut Value, mut f: impl FnMut(&mut Map<String, Value>)) -> Result<(), String> {
    match document_object(doc)?.get_mut("clusters") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(list)) => {
            list.iter_mut().filter_map(Value::as_object_mut).for_each(&mut f);
            Ok(())
        }
        Some(_) => Err("`clusters` is not a list".into()),
    }
}

// v1: early builds stored clusters as an object keyed by id.
fn clusters_as_list(mut doc: Value) -> Result<Value, String> {
    let obj = document_object(&mut doc)?;
    let clusters = match obj.remove("clusters") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(list)) => list,
        Some(Value::Object(by_id)) => by_id
            .into_iter()
            .map(|(id, mut cluster)| {
                if let Some(fields) = cluster.as_object_mut() {
                    fields.entry("id").or_insert(Value::String(id));
                }
                cluster
            })
            .collect(),
        Some(other) => return Err(format!("`clusters` must be a list or an object, got {other}")),
    };
    obj.insert("clusters".into(), Value::Array(clusters));
    Ok(doc)
}

const LEGACY_PREFERENCE_KEYS: &[&str] = &["clusterName", "icon", "iconOrder", "httpsProxy", "terminalCWD"];

// v2: display settings moved from the record into `preferences`.
fn preferences_bag(mut doc: Value) -> Result<Value, String> {
    for_each_cluster(&mut doc, |cluster| {
        let lifted: Vec<(String, Value)> = LEGACY_PREFERENCE_KEYS
            .iter()
            .filter_map(|key| cluster.get(*key).map(|v| ((*key).to_string(), v.clone())))
            .collect();
        if lifted.is_empty() {
            return;
        }
        let prefs = cluster
            .entry("preferences")
            .or_insert_with(|| Value::Object(Map::new()));
        if prefs.is_null() {
            *prefs = Value::Object(Map::new());
        }
        let Some(prefs) = prefs.as_object_mut() else {
            return;
        };
        for (key, value) in lifted {
            prefs.entry(key).or_insert(value);
        }
        for key in LEGACY_PREFERENCE_KEYS {
            cluster.remove(*key);
        }
    })?;
    Ok(doc)
}

// v3: namespaces used to be a comma separated string.
fn accessible_namespaces_list(mut doc: Value) -> Result<Value, String> {
    for_each_cluster(&mut doc, |cluster| {
        let replacement = match cluster.get("accessibleNamespaces") {
            Some(Value::Null) => None,
            Some(Value::String(joined)) => Some(
                joined
                    .split(',')
                    .map(str::trim)
                    .filter(|ns| !ns.is_empty())
                    .map(|ns| Value::String(ns.to_string()))
                    .collect(),
            ),
            _ => return,
        };
        match replacement {
            Some(list) => {
                cluster.insert("accessibleNamespaces".into(), Value::Array(list));
            }
            None => {
                cluster.remove("accessibleNamespaces");
            }
        }
    })?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn legacy_document() -> Value {
        json!({
            "clusters": {
                "c1": {
                    "kubeConfigPath": "/home/me/.kube/config",
                    "contextName": "dev",
                    "clusterName": "Dev cluster",
                    "terminalCWD": "/srv",
                    "accessibleNamespaces": "default, kube-system,,"
                },
                "c2": {
                    "id": "c2",
                    "kubeConfigPath": "/k/c2",
                    "preferences": { "clusterName": "kept" },
                    "clusterName": "dropped",
                    "accessibleNamespaces": null
                }
            }
        })
    }

    #[test]
    fn chain_versions_are_strictly_increasing() {
        let versions: Vec<u32> = CLUSTER_STORE_MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");
        assert!(versions[0] > 0);
    }

    #[test]
    fn legacy_document_reaches_current_shape() {
        let out = migrate(legacy_document(), CLUSTER_STORE_MIGRATIONS).unwrap();
        assert_eq!(out.from_version, 0);
        assert_eq!(out.applied, vec![1, 2, 3]);

        let doc = out.document;
        assert_eq!(doc["schemaVersion"], 3);
        let clusters = doc["clusters"].as_array().unwrap();
        let c1 = clusters.iter().find(|c| c["id"] == "c1").unwrap();
        assert_eq!(c1["preferences"]["clusterName"], "Dev cluster");
        assert_eq!(c1["preferences"]["terminalCWD"], "/srv");
        assert!(c1.get("clusterName").is_none());
        assert_eq!(c1["accessibleNamespaces"], json!(["default", "kube-system"]));

        let c2 = clusters.iter().find(|c| c["id"] == "c2").unwrap();
        assert_eq!(c2["preferences"]["clusterName"], "kept");
        assert!(c2.get("accessibleNamespaces").is_none());
    }

    #[test]
    fn remigrating_current_document_is_a_no_op() {
        let once = migrate(legacy_document(), CLUSTER_STORE_MIGRATIONS).unwrap().document;
        let twice = migrate(once.clone(), CLUSTER_STORE_MIGRATIONS).unwrap();
        assert!(twice.applied.is_empty());
        assert_eq!(twice.document, once);
    }

    #[test]
    fn every_step_is_idempotent() {
        let mut doc = legacy_document();
        for step in CLUSTER_STORE_MIGRATIONS {
            doc = (step.migrate)(doc).unwrap();
            let again = (step.migrate)(doc.clone()).unwrap();
            assert_eq!(again, doc, "step {} is not idempotent", step.name);
        }
    }

    #[test]
    fn starts_after_recorded_version() {
        let doc = json!({
            "schemaVersion": 2,
            "clusters": [{ "id": "a", "kubeConfigPath": "/k", "accessibleNamespaces": "x" }]
        });
        let out = migrate(doc, CLUSTER_STORE_MIGRATIONS).unwrap();
        assert_eq!(out.applied, vec![3]);
        assert_eq!(out.document["clusters"][0]["accessibleNamespaces"], json!(["x"]));
    }

    #[test]
    fn empty_document_gets_an_empty_list() {
        let out = migrate(json!({}), CLUSTER_STORE_MIGRATIONS).unwrap();
        assert_eq!(out.document, json!({ "schemaVersion": 3, "clusters": [] }));
    }

    #[test]
    fn non_object_entries_pass_through_untouched() {
        let doc = json!({ "clusters": [42, { "id": "a", "kubeConfigPath": "/k" }] });
        let out = migrate(doc, CLUSTER_STORE_MIGRATIONS).unwrap();
        assert_eq!(out.document["clusters"][0], 42);
    }

    #[test]
    fn unusable_input_is_rejected() {
        let err = migrate(json!({ "clusters": "nope" }), CLUSTER_STORE_MIGRATIONS).unwrap_err();
        assert_eq!(err.version, 1);

        let err = migrate(json!({ "schemaVersion": "three" }), CLUSTER_STORE_MIGRATIONS).unwrap_err();
        assert_eq!(err.name, "read-version");

        assert!(migrate(json!([1, 2]), CLUSTER_STORE_MIGRATIONS).is_err());
    }
}
