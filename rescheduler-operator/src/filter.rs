//! Scheduler extender `filter` verb.
//!
//! Removes the nodes listed in a pod's `kse.com/scheduled-hosts` hint from
//! the scheduler's candidates. If that would leave no candidates, or the
//! hint cannot be decoded, the candidates are returned unfiltered.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ledger::{HINT_ANNOTATION, codec};

/// Reason reported for filtered nodes.
const EXCLUDED_REASON: &str = "node previously failed this workload";

/// Pod as sent by the scheduler. Only metadata is read.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExtenderPod {
    /// Pod metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
}

/// Node list in full-object mode. Items are passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NodeItems {
    /// Node objects.
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Scheduler extender filter request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderArgs {
    /// Pod being scheduled.
    #[serde(alias = "Pod", default)]
    pub pod: ExtenderPod,
    /// Candidates, when the extender is not node-cache capable.
    #[serde(alias = "Nodes", default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeItems>,
    /// Candidate names, when the extender is node-cache capable.
    #[serde(
        rename = "nodenames",
        alias = "NodeNames",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub node_names: Option<Vec<String>>,
}

/// Scheduler extender filter response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderFilterResult {
    /// Surviving nodes, full-object mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeItems>,
    /// Surviving node names, node-cache mode.
    #[serde(rename = "nodenames", skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    /// Node name → reason for each filtered node.
    #[serde(default)]
    pub failed_nodes: BTreeMap<String, String>,
    /// Error message; empty on success.
    #[serde(default)]
    pub error: String,
}

/// Nodes the pod's hint asks to avoid. Empty when absent or undecodable.
pub fn excluded_nodes(pod: &ExtenderPod) -> BTreeSet<String> {
    let Some(raw) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(HINT_ANNOTATION))
    else {
        return BTreeSet::new();
    };
    match codec::decode_hint(raw) {
        Ok(hosts) => hosts.into_iter().collect(),
        Err(e) => {
            tracing::warn!(
                pod = %pod.metadata.name.as_deref().unwrap_or_default(),
                error = %e,
                "Undecodable scheduling hint; not filtering"
            );
            BTreeSet::new()
        }
    }
}

/// Filter `candidates` by `excluded`, falling back to all candidates when
/// nothing would survive.
pub fn filter_names(candidates: &[String], excluded: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
    let (kept, dropped): (Vec<String>, Vec<String>) = candidates
        .iter()
        .cloned()
        .partition(|n| !excluded.contains(n));
    if kept.is_empty() {
        (candidates.to_vec(), Vec::new())
    } else {
        (kept, dropped)
    }
}

/// Handle a filter request.
pub fn filter(args: &ExtenderArgs) -> ExtenderFilterResult {
    let excluded = excluded_nodes(&args.pod);

    let (nodes, node_names, dropped) = match (&args.node_names, &args.nodes) {
        (Some(names), _) => {
            let (kept, dropped) = filter_names(names, &excluded);
            (None, Some(kept), dropped)
        }
        (None, Some(list)) => {
            let names: Vec<String> = list.items.iter().map(node_name).collect();
            let (kept, dropped) = filter_names(&names, &excluded);
            let items = list
                .items
                .iter()
                .filter(|item| !dropped.contains(&node_name(item)))
                .cloned()
                .collect();
            (Some(NodeItems { items }), None, dropped)
        }
        (None, None) => (None, None, Vec::new()),
    };

    if !dropped.is_empty() {
        tracing::debug!(
            pod = %args.pod.metadata.name.as_deref().unwrap_or_default(),
            excluded = ?dropped,
            "Filtered previously failed nodes"
        );
    }

    ExtenderFilterResult {
        nodes,
        node_names,
        failed_nodes: dropped
            .into_iter()
            .map(|n| (n, EXCLUDED_REASON.to_string()))
            .collect(),
        error: String::new(),
    }
}

fn node_name(item: &Value) -> String {
    item.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
