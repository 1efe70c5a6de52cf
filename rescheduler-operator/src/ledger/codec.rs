//! Annotation encoding for retry ledgers.
//!
//! Records are written with the attempt counter first and the hosts field
//! second. An empty host set is written as `null`. The decoder accepts
//! `null`, `[]` or a missing hosts field.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use super::{ATTEMPTS_FIELD, BUDGET_ANNOTATION, Ledger, LedgerSchema};
use crate::error::{OperatorError, OperatorResult};

/// Hosts field used inside StatefulSet map entries.
const POD_HOSTS_FIELD: &str = "podScheduledHosts";

/// Decode the ledger for `pod_name` from an object's annotations.
///
/// Returns `Ok(None)` when the object has no ledger yet, or for
/// [`LedgerSchema::PodMap`] when the map has no entry for the pod.
pub fn decode(
    schema: LedgerSchema,
    annotations: Option<&BTreeMap<String, String>>,
    pod_name: &str,
    object: &str,
) -> OperatorResult<Option<Ledger>> {
    let Some(raw) = annotations.and_then(|a| a.get(schema.key())) else {
        return Ok(None);
    };
    let decode_err = |cause: String| OperatorError::LedgerDecode {
        key: schema.key().to_string(),
        object: object.to_string(),
        cause,
    };

    match schema {
        LedgerSchema::Hosts { field, .. } => decode_record(raw, field).map(Some).map_err(decode_err),
        LedgerSchema::PodMap { .. } => {
            let map = parse_pod_map(raw).map_err(decode_err)?;
            match map.get(pod_name) {
                Some(entry) => decode_record(entry.get(), POD_HOSTS_FIELD)
                    .map(Some)
                    .map_err(decode_err),
                None => Ok(None),
            }
        }
        LedgerSchema::Counter { .. } => serde_json::from_str::<u32>(raw)
            .map(|attempts| Some(Ledger::cleared(attempts)))
            .map_err(|e| decode_err(e.to_string())),
    }
}

/// Render the annotation value that stores `ledger` for `pod_name`.
///
/// For [`LedgerSchema::PodMap`], `current` is the annotation as last read
/// from the store. Every other pod's entry is carried over byte-for-byte.
pub fn render(
    schema: LedgerSchema,
    current: Option<&str>,
    pod_name: &str,
    ledger: &Ledger,
    object: &str,
) -> OperatorResult<String> {
    match schema {
        LedgerSchema::Hosts { field, .. } => Ok(serde_json::to_string(&Record { field, ledger })?),
        LedgerSchema::PodMap { key } => {
            let mut map = match current {
                Some(raw) => parse_pod_map(raw).map_err(|cause| OperatorError::LedgerDecode {
                    key: key.to_string(),
                    object: object.to_string(),
                    cause,
                })?,
                None => BTreeMap::new(),
            };
            let entry = serde_json::to_string(&Record {
                field: POD_HOSTS_FIELD,
                ledger,
            })?;
            map.insert(pod_name.to_string(), RawValue::from_string(entry)?);
            Ok(serde_json::to_string(&map)?)
        }
        LedgerSchema::Counter { .. } => Ok(ledger.attempts.to_string()),
    }
}

/// Read the declared retry budget, if the object carries one.
pub fn decode_budget(
    annotations: Option<&BTreeMap<String, String>>,
    object: &str,
) -> OperatorResult<Option<i64>> {
    let Some(raw) = annotations.and_then(|a| a.get(BUDGET_ANNOTATION)) else {
        return Ok(None);
    };
    serde_json::from_str::<i64>(raw)
        .map(Some)
        .map_err(|_| OperatorError::InvalidBudget {
            object: object.to_string(),
            value: raw.clone(),
        })
}

/// Decode a scheduling-hint annotation value into node names.
pub fn decode_hint(raw: &str) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Encode node names as a scheduling-hint annotation value.
pub fn encode_hint(ledger: &Ledger) -> OperatorResult<String> {
    Ok(serde_json::to_string(&ledger.excluded_hosts)?)
}

fn parse_pod_map(raw: &str) -> Result<BTreeMap<String, Box<RawValue>>, String> {
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

fn decode_record(raw: &str, field: &str) -> Result<Ledger, String> {
    let record: Map<String, Value> = serde_json::from_str(raw).map_err(|e| e.to_string())?;

    let attempts = match record.get(ATTEMPTS_FIELD) {
        None | Some(Value::Null) => 0,
        Some(v) => u32::deserialize(v).map_err(|e| format!("{ATTEMPTS_FIELD}: {e}"))?,
    };
    let excluded_hosts = match record.get(field) {
        None | Some(Value::Null) => Default::default(),
        Some(v) => Vec::<String>::deserialize(v)
            .map_err(|e| format!("{field}: {e}"))?
            .into_iter()
            .collect(),
    };

    Ok(Ledger {
        attempts,
        excluded_hosts,
    })
}

/// Serializes a ledger as `{"currentReschedulingTimes":N,"<field>":[..]|null}`.
struct Record<'a> {
    field: &'a str,
    ledger: &'a Ledger,
}

impl Serialize for Record<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(ATTEMPTS_FIELD, &self.ledger.attempts)?;
        if self.ledger.excluded_hosts.is_empty() {
            map.serialize_entry(self.field, &Option::<()>::None)?;
        } else {
            map.serialize_entry(self.field, &self.ledger.excluded_hosts)?;
        }
        map.end()
    }
}
